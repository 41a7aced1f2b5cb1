use std::error::Error;
use std::fmt;

/// Set-up failures of the controller binary. The firmware itself reports
/// through its replies, not through errors.
#[derive(Debug)]
pub enum ControllerError {
    Serial(serialport::Error),
    Io(std::io::Error),
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            ControllerError::Serial(ref e) => Some(e),
            ControllerError::Io(ref e) => Some(e),
        }
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ControllerError::Serial(ref e) => write!(f, "Serial port error: {}", e),
            ControllerError::Io(ref e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl From<serialport::Error> for ControllerError {
    fn from(err: serialport::Error) -> Self {
        ControllerError::Serial(err)
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(err: std::io::Error) -> Self {
        ControllerError::Io(err)
    }
}
