pub mod config;
pub mod debug;
pub mod diverter;
pub mod os;
pub mod packet;
pub mod pcap;
