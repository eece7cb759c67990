use std::fmt;

/// In-band error codes carried as `ERROR <code>` on a control channel.
///
/// The same table is shared by the tracker and peer protocols.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A0
    IndexStorage,
    /// A1
    IndexNullName,
    /// A2
    IndexNullHash,
    /// A3
    IndexNullSize,
    /// A4
    DuplicateFile,
    /// C0
    UnknownCommand,
    /// D0
    DeleteStorage,
    /// D1
    DeleteNullName,
    /// D2
    DeleteNullHash,
    /// G0
    MissingFilename,
    /// G1
    TransferFailed,
    /// L0
    ListStorage,
    /// R0
    RequestStorage,
    /// R1
    RequestNullName,
    /// Anything the table does not know, kept verbatim
    Unknown(String),
}

impl ErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "A0" => ErrorCode::IndexStorage,
            "A1" => ErrorCode::IndexNullName,
            "A2" => ErrorCode::IndexNullHash,
            "A3" => ErrorCode::IndexNullSize,
            "A4" => ErrorCode::DuplicateFile,
            "C0" => ErrorCode::UnknownCommand,
            "D0" => ErrorCode::DeleteStorage,
            "D1" => ErrorCode::DeleteNullName,
            "D2" => ErrorCode::DeleteNullHash,
            "G0" => ErrorCode::MissingFilename,
            "G1" => ErrorCode::TransferFailed,
            "L0" => ErrorCode::ListStorage,
            "R0" => ErrorCode::RequestStorage,
            "R1" => ErrorCode::RequestNullName,
            other => ErrorCode::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::IndexStorage => "A0",
            ErrorCode::IndexNullName => "A1",
            ErrorCode::IndexNullHash => "A2",
            ErrorCode::IndexNullSize => "A3",
            ErrorCode::DuplicateFile => "A4",
            ErrorCode::UnknownCommand => "C0",
            ErrorCode::DeleteStorage => "D0",
            ErrorCode::DeleteNullName => "D1",
            ErrorCode::DeleteNullHash => "D2",
            ErrorCode::MissingFilename => "G0",
            ErrorCode::TransferFailed => "G1",
            ErrorCode::ListStorage => "L0",
            ErrorCode::RequestStorage => "R0",
            ErrorCode::RequestNullName => "R1",
            ErrorCode::Unknown(code) => code,
        }
    }

    /// Human-readable cause for the code.
    pub fn description(&self) -> String {
        let text = match self {
            ErrorCode::IndexStorage => {
                "a database error occurred while indexing files with tracker"
            }
            ErrorCode::IndexNullName => {
                "a null file name was encountered while indexing files with tracker"
            }
            ErrorCode::IndexNullHash => {
                "a null file hash was encountered while indexing files with tracker"
            }
            ErrorCode::IndexNullSize => {
                "a null file size was encountered while indexing files with tracker"
            }
            ErrorCode::DuplicateFile => {
                "a duplicate file from your machine was encountered while indexing files with tracker"
            }
            ErrorCode::UnknownCommand => "remote received an unknown command",
            ErrorCode::DeleteStorage => {
                "a database error occurred while deleting files from the tracker"
            }
            ErrorCode::DeleteNullName => {
                "a null file name was encountered while deleting files from tracker"
            }
            ErrorCode::DeleteNullHash => {
                "a null file hash was encountered while deleting files from tracker"
            }
            ErrorCode::MissingFilename => {
                "a null file name was encountered when attempting file transfer"
            }
            ErrorCode::TransferFailed => "file transfer with peer failed",
            ErrorCode::ListStorage => {
                "a database error occurred while retrieving a list of files from the tracker"
            }
            ErrorCode::RequestStorage => {
                "a database error occurred while requesting peer addresses from the tracker"
            }
            ErrorCode::RequestNullName => {
                "a null file name was encountered while requesting peer addresses from the tracker"
            }
            ErrorCode::Unknown(code) => {
                return format!("an unknown error occurred: ERROR {}", code);
            }
        };
        text.to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR {}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_survive_parse() {
        for code in [
            "A0", "A1", "A2", "A3", "A4", "C0", "D0", "D1", "D2", "G0", "G1", "L0", "R0", "R1",
        ] {
            let parsed = ErrorCode::parse(code);
            assert!(!matches!(parsed, ErrorCode::Unknown(_)), "{} not in table", code);
            assert_eq!(parsed.as_str(), code);
        }
    }

    #[test]
    fn test_unknown_code() {
        let code = ErrorCode::parse("Z9");
        assert_eq!(code, ErrorCode::Unknown("Z9".to_string()));
        assert_eq!(code.description(), "an unknown error occurred: ERROR Z9");
        assert_eq!(code.to_string(), "ERROR Z9");
    }

    #[test]
    fn test_transfer_descriptions() {
        assert_eq!(
            ErrorCode::MissingFilename.description(),
            "a null file name was encountered when attempting file transfer"
        );
        assert_eq!(ErrorCode::TransferFailed.description(), "file transfer with peer failed");
    }
}
