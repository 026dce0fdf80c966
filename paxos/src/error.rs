//! Error contexts used with [`error_stack::Report`].
//!
//! Protocol rejections are not errors: they are expressed as zero-id
//! [`Promise`](crate::Promise)s and [`Proposal`](crate::Proposal)s.

use std::fmt;

/// A [`Log`](crate::Log) could not encode, decode, read or persist a record.
#[derive(Debug)]
pub struct LogError;

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("log operation failed")
    }
}

impl core::error::Error for LogError {}

/// The acceptor failed to persist or serve its state.
#[derive(Debug)]
pub struct AcceptorError;

impl fmt::Display for AcceptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("acceptor operation failed")
    }
}

impl core::error::Error for AcceptorError {}

/// A remote call to an acceptor (dial, prepare, accept or observe) failed.
#[derive(Debug)]
pub struct RpcError;

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("acceptor rpc failed")
    }
}

impl core::error::Error for RpcError {}

#[derive(Debug)]
pub struct ProposeError;

impl fmt::Display for ProposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("proposal did not complete")
    }
}

impl core::error::Error for ProposeError {}

#[derive(Debug)]
pub struct ObserverError;

impl fmt::Display for ObserverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("observer failed")
    }
}

impl core::error::Error for ObserverError {}

/// A participant was built with missing or unusable configuration.
#[derive(Debug)]
pub struct ConfigError;

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid paxos configuration")
    }
}

impl core::error::Error for ConfigError {}

#[derive(Debug)]
pub struct PaxosError;

impl fmt::Display for PaxosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("paxos participant stopped")
    }
}

impl core::error::Error for PaxosError {}
