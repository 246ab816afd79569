use alloc::string::String;
use arrayvec::CapacityError;
use core::num::TryFromIntError;
use num_enum::{TryFromPrimitive, TryFromPrimitiveError};

#[derive(Debug, PartialEq)]
pub enum Error {
    NotFound,
    NotSupported,
    Exhausted,
    MissingDevice(String),
    InvalidValue(String),
    InvalidDevice(String),
}

impl<T: TryFromPrimitive> From<TryFromPrimitiveError<T>> for Error {
    fn from(error: TryFromPrimitiveError<T>) -> Error {
        Error::InvalidValue(format!("{}", error))
    }
}

impl From<TryFromIntError> for Error {
    fn from(error: TryFromIntError) -> Error {
        Error::InvalidValue(format!("{}", error))
    }
}

impl<T> From<CapacityError<T>> for Error {
    fn from(_error: CapacityError<T>) -> Error {
        Error::Exhausted
    }
}

pub type Result<T> = core::result::Result<T, Error>;
