//! String handler surface.
//!
//! Hosts address the monitor through named text endpoints: read handlers
//! return strings, write handlers parse their input before touching any
//! state, so a rejected write has no partial effect.
//!
//! | name | dir | input | output / effect |
//! |---|---|---|---|
//! | `thresh` | R | — | effective threshold |
//! | `look` | R | — | seconds since reset + rate table |
//! | `mem` | R | — | live bytes |
//! | `memmax` | R | — | ceiling in bytes |
//! | `anno_level` | W | `ip level seconds` | arm an annotation rule |
//! | `reset` | W | — | drop all buckets |
//! | `memmax` | W | KiB | move the ceiling, folding if needed |

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::clock::TickClock;
use crate::monitor::RateMonitor;

/// Rejected handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown handler {0:?}")]
    UnknownHandler(String),
    #[error("expecting {expected} argument(s), got {got}")]
    BadArgCount { expected: usize, got: usize },
    #[error("not an IP address: {0:?}")]
    BadAddress(String),
    #[error("not an integer: {0:?}")]
    BadInteger(String),
    #[error("level must be between 0 and 3")]
    BadLevel,
    #[error("expiry must be at least 1 second")]
    BadExpiry,
}

fn parse_int<T: FromStr>(arg: &str) -> Result<T, HandlerError> {
    arg.parse()
        .map_err(|_| HandlerError::BadInteger(arg.to_string()))
}

fn split_args(input: &str, expected: usize) -> Result<Vec<&str>, HandlerError> {
    let args: Vec<&str> = input.split_whitespace().collect();
    if args.len() != expected {
        return Err(HandlerError::BadArgCount {
            expected,
            got: args.len(),
        });
    }
    Ok(args)
}

impl<C: TickClock> RateMonitor<C> {
    /// Dispatch a named read handler.
    pub fn read_handler(&self, name: &str) -> Result<String, HandlerError> {
        match name {
            "thresh" => Ok(self.effective_thresh().to_string()),
            "look" => Ok(self.look()),
            "mem" => Ok(format!("{}\n", self.allocated_bytes())),
            "memmax" => Ok(format!("{}\n", self.memmax_bytes())),
            _ => Err(HandlerError::UnknownHandler(name.to_string())),
        }
    }

    /// Dispatch a named write handler with its text input.
    pub fn write_handler(&self, name: &str, input: &str) -> Result<(), HandlerError> {
        match name {
            "reset" => {
                self.reset();
                Ok(())
            }
            "memmax" => {
                let args = split_args(input, 1)?;
                let kib: usize = parse_int(args[0])?;
                self.set_memmax_kib(kib);
                Ok(())
            }
            "anno_level" => {
                let args = split_args(input, 3)?;
                let addr: Ipv4Addr = args[0]
                    .parse()
                    .map_err(|_| HandlerError::BadAddress(args[0].to_string()))?;
                let level: u8 = parse_int(args[1])?;
                if level > 3 {
                    return Err(HandlerError::BadLevel);
                }
                let seconds: u64 = parse_int(args[2])?;
                if seconds < 1 {
                    return Err(HandlerError::BadExpiry);
                }
                let until = self.clock().now() + seconds * self.clock().freq();
                self.set_anno_level(addr, level, until);
                Ok(())
            }
            _ => Err(HandlerError::UnknownHandler(name.to_string())),
        }
    }
}
