//! Input/output classification of the fibers.
//!
//! Half the fibers on a typical bench feed light in, the other half read it
//! out; the coupling produced by moving an input fiber is observed on the
//! output fiber its light reaches. The mapping records, per fiber, whether
//! it is an input or an output, and for inputs, which output correlates
//! with it.
//!
//! The table can be loaded from a small text file so a rewired bench does
//! not need a rebuild. One line per fiber, 1-based indices:
//!
//! ```text
//! # fiber  direction  [read fiber]
//! 1 in 5
//! 5 out
//! ```

use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberList};
use crate::NUM_FIBERS;
use std::path::Path;

/// Role of one fiber.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Light is launched into the bench through this fiber.
    Input,
    /// Coupled power is read out of this fiber.
    Output,
}

/// Per-fiber classification table.
#[derive(Debug, Clone)]
pub struct Mapping {
    direction: [Option<Direction>; NUM_FIBERS],
    reads: [Option<Fiber>; NUM_FIBERS],
}

impl Mapping {
    /// An empty mapping; every fiber is unclassified and will not take part
    /// in alignment.
    pub fn empty() -> Self {
        Self {
            direction: [None; NUM_FIBERS],
            reads: [None; NUM_FIBERS],
        }
    }

    /// Classify `fiber` as an input whose coupling is observed at `read`.
    pub fn set_input(&mut self, fiber: Fiber, read: Fiber) {
        self.direction[fiber.index()] = Some(Direction::Input);
        self.reads[fiber.index()] = Some(read);
    }

    /// Classify `fiber` as an output.
    pub fn set_output(&mut self, fiber: Fiber) {
        self.direction[fiber.index()] = Some(Direction::Output);
        self.reads[fiber.index()] = None;
    }

    /// Role of `fiber`, if classified.
    pub fn direction(&self, fiber: Fiber) -> Option<Direction> {
        self.direction[fiber.index()]
    }

    /// All input fibers, in index order.
    pub fn input_list(&self) -> FiberList {
        self.list_of(Direction::Input)
    }

    /// All output fibers, in index order.
    pub fn output_list(&self) -> FiberList {
        self.list_of(Direction::Output)
    }

    fn list_of(&self, wanted: Direction) -> FiberList {
        let mut list = FiberList::new();
        for (i, dir) in self.direction.iter().enumerate() {
            if *dir == Some(wanted) {
                // Index is in range by construction.
                let _ = list.push(Fiber::new(i).expect("fiber table index"));
            }
        }
        list
    }

    /// The fiber whose reading evaluates a move of `fiber`: the correlated
    /// output for inputs, the fiber itself for outputs.
    pub fn read_fiber_for(&self, fiber: Fiber) -> Fiber {
        self.reads[fiber.index()].unwrap_or(fiber)
    }

    /// Parse a mapping from its text form. Lines are
    /// `<fiber> in <read_fiber>` or `<fiber> out`, 1-based; blank lines and
    /// `#` comments are ignored. Classifying the same fiber twice is an
    /// error.
    pub fn parse(text: &str) -> Result<Self> {
        let mut mapping = Self::empty();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut words = line.split_whitespace();
            let fiber = parse_fiber(words.next(), lineno)?;
            if mapping.direction[fiber.index()].is_some() {
                return Err(Error::Invalid(format!(
                    "mapping line {}: fiber {} classified twice",
                    lineno + 1,
                    fiber.wire_index()
                )));
            }
            match words.next() {
                Some("in") => {
                    let read = parse_fiber(words.next(), lineno)?;
                    mapping.set_input(fiber, read);
                }
                Some("out") => mapping.set_output(fiber),
                other => {
                    return Err(Error::Invalid(format!(
                        "mapping line {}: expected `in` or `out`, got {:?}",
                        lineno + 1,
                        other
                    )));
                }
            }
            if words.next().is_some() {
                return Err(Error::Invalid(format!(
                    "mapping line {}: trailing tokens",
                    lineno + 1
                )));
            }
        }
        Ok(mapping)
    }

    /// Load a mapping file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Unexpected(format!("read {}: {e}", path.display())))?;
        Self::parse(&text)
    }
}

impl Default for Mapping {
    /// The as-built bench: fibers 1–4 are inputs read at outputs 5–8.
    fn default() -> Self {
        let mut mapping = Self::empty();
        let half = NUM_FIBERS / 2;
        for i in 0..half {
            let input = Fiber::new(i).expect("fiber table index");
            let output = Fiber::new(i + half).expect("fiber table index");
            mapping.set_input(input, output);
            mapping.set_output(output);
        }
        mapping
    }
}

fn parse_fiber(word: Option<&str>, lineno: usize) -> Result<Fiber> {
    let word = word.ok_or_else(|| {
        Error::Invalid(format!("mapping line {}: missing fiber index", lineno + 1))
    })?;
    let n: usize = word.parse().map_err(|_| {
        Error::Invalid(format!("mapping line {}: bad fiber index `{word}`", lineno + 1))
    })?;
    Fiber::from_wire(n)
}
