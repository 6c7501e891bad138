/*!
Tests for error construction and formatting.
*/

#[cfg(test)]
mod tests {
    use crate::error::SnapvaultError;
    use std::io;

    #[test]
    fn test_error_display() {
        let error = SnapvaultError::validation("bucket is empty");
        assert_eq!(error.to_string(), "Validation error: bucket is empty");

        let error = SnapvaultError::compression("truncated frame");
        assert_eq!(error.to_string(), "Compression error: truncated frame");

        let error = SnapvaultError::storage("connection reset");
        assert_eq!(error.to_string(), "Storage error: connection reset");

        let error = SnapvaultError::invalid_listing("duplicate name a.db");
        assert_eq!(error.to_string(), "Invalid snapshot listing: duplicate name a.db");
    }

    #[test]
    fn test_not_found_reports_request_and_every_candidate() {
        let error = SnapvaultError::SnapshotNotFound {
            requested: "snap.db".to_string(),
            tried: vec!["snap.db.zst".to_string(), "snap.db".to_string()],
        };

        let message = error.to_string();
        assert!(message.contains("snap.db"));
        assert!(message.contains("snap.db.zst, snap.db"));
        assert!(error.is_not_found());
        assert!(!SnapvaultError::storage("x").is_not_found());
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = SnapvaultError::from(io_error);

        match error {
            SnapvaultError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = SnapvaultError::from(json_error);

        assert!(matches!(error, SnapvaultError::Json(_)));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SnapvaultError>();
        assert_sync::<SnapvaultError>();
    }
}
