mod channel;
mod config;
mod network;
