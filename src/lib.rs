pub mod board;
pub mod commands;
pub mod connection;
pub mod modbus;
pub mod output;
pub mod poll;
pub mod redfish;
pub mod registers;
pub mod wide_value;
