use garde::Validate;
use serde::{Deserialize, Serialize};

/// One finished game, as written to `result.json` in the session directory.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct GameResult {
    #[garde(length(chars, min = 1, max = 32))]
    pub nickname: String,

    /// Rank label, e.g. "初心者".
    #[garde(length(min = 1, max = 64))]
    pub rank: String,

    #[serde(default)]
    #[garde(skip)]
    pub level: Option<String>,

    #[garde(skip)]
    pub score: i64,

    /// "YYYY-MM-DD HH:MM:SS" in JST.
    #[serde(rename = "timestampJST")]
    #[garde(length(min = 1))]
    pub timestamp_jst: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub photo: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_kiosk_result_file() {
        let json = r#"{"nickname":"Taro","rank":"初心者","score":120,"timestampJST":"2025-08-16 17:23:54"}"#;
        let result: GameResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.nickname, "Taro");
        assert_eq!(result.score, 120);
        assert_eq!(result.timestamp_jst, "2025-08-16 17:23:54");
        assert!(result.level.is_none());
        assert!(result.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_nickname() {
        let result = GameResult {
            nickname: String::new(),
            rank: "初心者".to_string(),
            level: None,
            score: 0,
            timestamp_jst: "2025-08-16 17:23:54".to_string(),
            photo: None,
        };
        assert!(result.validate().is_err());
    }
}
