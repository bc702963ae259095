use std::fmt;

#[derive(Debug, Clone)]
pub enum IntoWimPathError {
    UnrepresentableStr,
    EscapesRoot,
}

impl std::error::Error for IntoWimPathError {}

impl fmt::Display for IntoWimPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl IntoWimPathError {
    pub fn as_str(&self) -> &str {
        match self {
            IntoWimPathError::UnrepresentableStr => "unrepresentable string found in path",
            IntoWimPathError::EscapesRoot => "path escapes the image root",
        }
    }
}

impl From<IntoWimPathError> for crate::Error {
    fn from(err: IntoWimPathError) -> crate::Error {
        crate::Error::InvalidParameter(err.as_str().to_string())
    }
}
