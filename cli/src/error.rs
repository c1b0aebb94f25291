use std::{fmt::Display, io};

use daq::DaqError;

pub enum CliError {
    IO(io::Error),
    Daq(DaqError),
    NoDevice,
    ManyDevices,
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<DaqError> for CliError {
    fn from(value: DaqError) -> Self {
        CliError::Daq(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Daq(err) => write!(f, "DAQ error: {err}"),
            CliError::NoDevice => write!(f, "No DAQ device"),
            CliError::ManyDevices => write!(f, "More than one DAQ device"),
        }
    }
}
