use crate::connection::{self, Connection, ErrorKind};
use crate::registers::{self, AnalogMode, AnalogPort, Function, Target};
use crate::wide_value;
use num_traits::ToPrimitive as _;
use std::sync::Arc;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not readable")]
    NotReadable(Function),
    #[error("`{0}` is not writable")]
    NotWritable(Function),
    #[error("`{function}` takes {expected} register value(s), but {actual} were given")]
    ValueCountMismatch { function: Function, expected: u16, actual: usize },
    #[error("value {0} does not fit into a 16-bit register")]
    ValueOutOfRange(i64),
    #[error("could not resolve the register address")]
    Resolve(#[source] registers::Error),
    #[error("could not encode the value")]
    Encode(#[source] wide_value::Error),
    #[error("modbus request for register {1} failed")]
    Transport(#[source] connection::Error, u16),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotReadable(_)
            | Error::NotWritable(_)
            | Error::ValueCountMismatch { .. }
            | Error::ValueOutOfRange(_) => ErrorKind::ValidationError,
            Error::Resolve(_) => ErrorKind::OutOfRange,
            Error::Encode(_) => ErrorKind::Overflow,
            Error::Transport(e, _) => e.kind(),
        }
    }
}

impl From<registers::Error> for Error {
    fn from(e: registers::Error) -> Self {
        Error::Resolve(e)
    }
}

/// The outcome of reading a function or a raw register range.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Reading {
    pub function: Option<Function>,
    pub address: u16,
    pub words: Vec<u16>,
    /// The words joined into one value, for single and double register functions.
    pub value: Option<u32>,
}

/// Board level operations on top of a [`Connection`].
#[derive(Clone)]
pub struct BoardClient {
    connection: Arc<Connection>,
    slave_id: u8,
}

impl BoardClient {
    pub fn new(connection: Arc<Connection>, slave_id: u8) -> Self {
        Self { connection, slave_id }
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub async fn read(&self, target: Target) -> Result<Reading, Error> {
        let function = target.function();
        if !function.mode().readable() {
            return Err(Error::NotReadable(function));
        }
        let words = self
            .connection
            .read_holdings(target.address(), self.slave_id, target.width())
            .await
            .map_err(|e| Error::Transport(e, target.address()))?;
        let value = match &words[..] {
            [word] => Some(u32::from(*word)),
            words => wide_value::from_words(words),
        };
        debug!(message = "read", %target, ?words);
        Ok(Reading { function: Some(function), address: target.address(), words, value })
    }

    /// Write exactly [`Target::width`] words, low word first.
    pub async fn write_words(&self, target: Target, values: &[u16]) -> Result<(), Error> {
        let function = target.function();
        if !function.mode().writable() {
            return Err(Error::NotWritable(function));
        }
        if values.len() != usize::from(target.width()) {
            return Err(Error::ValueCountMismatch {
                function,
                expected: target.width(),
                actual: values.len(),
            });
        }
        debug!(message = "write", %target, ?values);
        let address = target.address();
        let result = match values {
            [value] => self.connection.write_single(address, self.slave_id, *value).await,
            values => self.connection.write_multiple(address, self.slave_id, values).await,
        };
        result.map_err(|e| Error::Transport(e, address))
    }

    /// Write an integer, splitting it across two registers for double width functions.
    pub async fn write_value(&self, target: Target, value: i64) -> Result<(), Error> {
        if target.width() == 2 {
            let (low, high) = wide_value::encode32(value).map_err(Error::Encode)?;
            self.write_words(target, &[low, high]).await
        } else {
            let word = u16::try_from(value).map_err(|_| Error::ValueOutOfRange(value))?;
            self.write_words(target, &[word]).await
        }
    }

    pub async fn set_analog_mode(
        &self,
        slot: u16,
        port: AnalogPort,
        mode: AnalogMode,
    ) -> Result<(), Error> {
        let target = Target::new(Function::AnalogMode, slot, port.channel())?;
        let value = mode.to_u16().unwrap_or_default();
        self.write_words(target, &[value]).await
    }

    pub async fn read_raw(&self, address: u16, count: u16) -> Result<Reading, Error> {
        let words = self
            .connection
            .read_holdings(address, self.slave_id, count)
            .await
            .map_err(|e| Error::Transport(e, address))?;
        Ok(Reading { function: None, address, words, value: None })
    }

    pub async fn write_raw(&self, address: u16, values: &[u16]) -> Result<(), Error> {
        let result = match values {
            [value] => self.connection.write_single(address, self.slave_id, *value).await,
            values => self.connection.write_multiple(address, self.slave_id, values).await,
        };
        result.map_err(|e| Error::Transport(e, address))
    }
}
