#![deny(unsafe_code)]

pub mod ebpf;
