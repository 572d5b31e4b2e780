pub mod catalog;
pub mod cluster;
pub mod commands;
pub mod connection;
pub mod decode;
pub mod derived;
pub mod discovery;
pub mod modbus;
pub mod mqtt;
pub mod output;
pub mod registers;
pub mod scheduler;
