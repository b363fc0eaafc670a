use serde::{Deserialize, Serialize};

/// Presence states understood by the peripheral firmware. The discriminant is the byte that is put
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Available = 0,
    Busy = 1,
    Away = 2,
    BeRightBack = 3,
    DoNotDisturb = 4,
    Focusing = 5,
    Presenting = 6,
    InAMeeting = 7,
    InACall = 8,
    Offline = 9,
    /// No new information. Never transmitted.
    Unknown = 10,
}

impl StatusCode {
    pub const ALL: [StatusCode; 11] = [
        StatusCode::Available,
        StatusCode::Busy,
        StatusCode::Away,
        StatusCode::BeRightBack,
        StatusCode::DoNotDisturb,
        StatusCode::Focusing,
        StatusCode::Presenting,
        StatusCode::InAMeeting,
        StatusCode::InACall,
        StatusCode::Offline,
        StatusCode::Unknown,
    ];

    pub fn is_known(self) -> bool {
        self != StatusCode::Unknown
    }

    /// The byte sent to the peripheral, or `None` for `Unknown`.
    pub fn wire_byte(self) -> Option<u8> {
        match self {
            StatusCode::Unknown => None,
            known => Some(known as u8),
        }
    }

    /// Maps a token found in the chat client's log to a status.
    pub fn from_log_token(token: &str) -> StatusCode {
        match token.to_ascii_lowercase().as_str() {
            "available" => StatusCode::Available,
            "busy" => StatusCode::Busy,
            "donotdisturb" | "dnd" => StatusCode::DoNotDisturb,
            "away" => StatusCode::Away,
            "berightback" | "brb" => StatusCode::BeRightBack,
            "focusing" => StatusCode::Focusing,
            "inameeting" | "meeting" => StatusCode::InAMeeting,
            "inacall" | "call" => StatusCode::InACall,
            "presenting" => StatusCode::Presenting,
            "offline" => StatusCode::Offline,
            _ => StatusCode::Unknown,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            StatusCode::Available => "Available",
            StatusCode::Busy => "Busy",
            StatusCode::Away => "Away",
            StatusCode::BeRightBack => "Be Right Back",
            StatusCode::DoNotDisturb => "Do Not Disturb",
            StatusCode::Focusing => "Focusing",
            StatusCode::Presenting => "Presenting",
            StatusCode::InAMeeting => "In a Meeting",
            StatusCode::InACall => "In a Call",
            StatusCode::Offline => "Offline",
            StatusCode::Unknown => "Unknown",
        };

        write!(f, "{}", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_byte_is_ordinal() {
        for (ordinal, status) in StatusCode::ALL.iter().enumerate() {
            if status.is_known() {
                assert_eq!(status.wire_byte(), Some(ordinal as u8));
            }
        }
        assert_eq!(StatusCode::Offline.wire_byte(), Some(9));
    }

    #[test]
    fn unknown_has_no_wire_byte() {
        assert_eq!(StatusCode::Unknown.wire_byte(), None);
    }

    #[test]
    fn log_tokens_are_case_insensitive() {
        assert_eq!(StatusCode::from_log_token("Busy"), StatusCode::Busy);
        assert_eq!(StatusCode::from_log_token("DoNotDisturb"), StatusCode::DoNotDisturb);
        assert_eq!(StatusCode::from_log_token("dnd"), StatusCode::DoNotDisturb);
        assert_eq!(StatusCode::from_log_token("BRB"), StatusCode::BeRightBack);
        assert_eq!(StatusCode::from_log_token("meeting"), StatusCode::InAMeeting);
        assert_eq!(StatusCode::from_log_token("Idle"), StatusCode::Unknown);
    }
}
