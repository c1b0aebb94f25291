#[derive(Debug)]
pub enum DaqError {
    Usb(nusb::Error),
    Transfer(nusb::transfer::TransferError),
    Io(std::io::Error),
    Status(u8),
    Timeout,
    NotConnected,
    DeadDevice,
    Overrun,
    Underrun,
    BadBufferSize,
    AlreadyActive,
    ConfigNotSupported,
    ShortReply { expected: usize, received: usize },
    Unhandled(String),
}

impl std::error::Error for DaqError {}

impl std::fmt::Display for DaqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaqError::Usb(err) => write!(f, "USB error: {}", err),
            DaqError::Transfer(err) => write!(f, "Transfer error: {}", err),
            DaqError::Io(err) => write!(f, "IO error: {}", err),
            DaqError::Status(code) => {
                write!(f, "Device status error: code {}", code)
            }
            DaqError::Timeout => write!(f, "Timeout"),
            DaqError::NotConnected => write!(f, "Device not connected"),
            DaqError::DeadDevice => {
                write!(f, "Device stopped responding")
            }
            DaqError::Overrun => {
                write!(f, "Input FIFO overrun")
            }
            DaqError::Underrun => {
                write!(f, "Output FIFO underrun")
            }
            DaqError::BadBufferSize => {
                write!(f, "Invalid scan buffer size")
            }
            DaqError::AlreadyActive => {
                write!(f, "A scan is already running on this direction")
            }
            DaqError::ConfigNotSupported => {
                write!(f, "Configuration not supported by this device")
            }
            DaqError::ShortReply { expected, received } => {
                write!(f, "Short reply: expected {expected} bytes, received {received}")
            }
            DaqError::Unhandled(msg) => write!(f, "Unhandled error: {msg}"),
        }
    }
}

impl From<nusb::Error> for DaqError {
    fn from(err: nusb::Error) -> Self {
        DaqError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for DaqError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        DaqError::Transfer(err)
    }
}

impl From<std::io::Error> for DaqError {
    fn from(err: std::io::Error) -> Self {
        DaqError::Io(err)
    }
}
