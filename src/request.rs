//! The shared request vocabulary of both control surfaces.
//!
//! Both channels speak the same four line-oriented commands; the framing
//! differs (canonical-mode serial vs. named pipes) but the words do not.
//! Fiber and pair indices are 1-based on the wire and become typed 0-based
//! [`Fiber`] values here.

use mams_core::context::RunParams;
use mams_core::{Error, Fiber, Result};

/// Identification string returned for `IDN`.
pub const IDENTIFIER: &str =
    concat!("MAMS multichannel alignment system v", env!("CARGO_PKG_VERSION"));

/// One parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `IDN`: identify the controller.
    Idn,
    /// `READ <fiber> <samples>`: averaged coupling of one fiber.
    Read {
        /// Fiber to sample.
        fiber: Fiber,
        /// Conversions to average.
        samples: u32,
    },
    /// `WRITE <pair> <left> <right>`: set one pair's biases directly.
    Write {
        /// Pair to update.
        fiber: Fiber,
        /// New left bias.
        left: u16,
        /// New right bias.
        right: u16,
    },
    /// `START <num_samples> <min_step_bits> <hysteresis>`: run an
    /// alignment with validated parameters.
    Start {
        /// Validated run parameters.
        params: RunParams,
    },
}

impl Request {
    /// Parse one request line. Commands are case-sensitive; anything
    /// malformed or out of range is an error the channel answers with
    /// `ERR`.
    pub fn parse(line: &str) -> Result<Request> {
        let mut words = line.split_whitespace();
        let request = match words.next() {
            Some("IDN") => Request::Idn,
            Some("READ") => Request::Read {
                fiber: wire_fiber(words.next())?,
                samples: number(words.next(), "sample count")?,
            },
            Some("WRITE") => Request::Write {
                fiber: wire_fiber(words.next())?,
                left: number(words.next(), "left bias")?,
                right: number(words.next(), "right bias")?,
            },
            Some("START") => {
                let num_samples = number(words.next(), "sample count")?;
                let min_step_bits = number(words.next(), "minimum step bits")?;
                let hysteresis = number(words.next(), "hysteresis step")?;
                Request::Start {
                    params: RunParams::from_wire(num_samples, min_step_bits, hysteresis)?,
                }
            }
            Some(other) => {
                return Err(Error::Invalid(format!("unknown command `{other}`")));
            }
            None => return Err(Error::Invalid("empty request".to_string())),
        };
        if words.next().is_some() {
            return Err(Error::Invalid(format!("trailing arguments in `{line}`")));
        }
        Ok(request)
    }
}

fn wire_fiber(word: Option<&str>) -> Result<Fiber> {
    Fiber::from_wire(number(word, "fiber index")?)
}

fn number<T: std::str::FromStr>(word: Option<&str>, what: &str) -> Result<T> {
    let word = word.ok_or_else(|| Error::Invalid(format!("missing {what}")))?;
    word.parse()
        .map_err(|_| Error::Invalid(format!("bad {what} `{word}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mams_core::MAX_STEP_SIZE;

    #[test]
    fn parses_the_vocabulary() {
        assert_eq!(Request::parse("IDN").unwrap(), Request::Idn);

        let read = Request::parse("READ 3 16").unwrap();
        assert_eq!(
            read,
            Request::Read { fiber: Fiber::new(2).unwrap(), samples: 16 }
        );

        let write = Request::parse("WRITE 1 100 65535").unwrap();
        assert_eq!(
            write,
            Request::Write { fiber: Fiber::new(0).unwrap(), left: 100, right: 65535 }
        );

        match Request::parse("START 8 4 32").unwrap() {
            Request::Start { params } => {
                assert_eq!(params.num_samples, 8);
                assert_eq!(params.min_step_size, 16);
                assert_eq!(params.max_step_size, MAX_STEP_SIZE);
                assert_eq!(params.hysteresis_step_size, 32);
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_requests() {
        for bad in [
            "",
            "HELLO",
            "idn",
            "READ",
            "READ 0 4",
            "READ 9 4",
            "READ 1 many",
            "WRITE 1 100",
            "WRITE 1 100 70000",
            "START 8 12 0",
            "IDN extra",
        ] {
            assert!(Request::parse(bad).is_err(), "accepted `{bad}`");
        }
    }
}
