//! Outbound data frames.
//!
//! Whichever channel owns a run receives one coupling frame and one bias
//! frame per iteration, line-oriented and 1-based so they can be eyeballed
//! on a serial console or grepped out of the run log:
//!
//! ```text
//! coupling:F1C33767F2C12001
//! bias:F1L32768R32768F2L31744R32768
//! ```

use crate::context::RunParams;
use crate::error::Result;
use crate::fiber::FiberList;
use crate::piezo::PiezoBank;
use crate::NUM_FIBERS;
use std::fmt::Write;

/// Destination of the per-iteration data stream.
///
/// The serial implementation blocks in [`FrameSink::emit`] until the
/// operator acknowledges the frame; the orchestrator implementation appends
/// to the run log. Emission is a cancellation point: an interrupted sink
/// aborts the run cleanly.
pub trait FrameSink {
    /// A run is starting with these parameters.
    fn start(&mut self, params: &RunParams) -> Result<()>;

    /// Deliver one frame line (newline included).
    fn emit(&mut self, frame: &str) -> Result<()>;

    /// The run is over; flush any footer.
    fn finish(&mut self) -> Result<()>;
}

/// Format the coupling frame for the fibers in `read_list`.
pub fn coupling_frame(read_list: &FiberList, new_coupling: &[u16; NUM_FIBERS]) -> String {
    let mut line = String::from("coupling:");
    for fiber in read_list.iter() {
        let _ = write!(line, "F{}C{}", fiber.wire_index(), new_coupling[fiber.index()]);
    }
    line.push('\n');
    line
}

/// Format the bias frame for the fibers in `move_list`.
pub fn bias_frame(move_list: &FiberList, bank: &PiezoBank) -> String {
    let mut line = String::from("bias:");
    for fiber in move_list.iter() {
        let (left, right) = bank.bias(fiber);
        let _ = write!(line, "F{}L{}R{}", fiber.wire_index(), left, right);
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Fiber;

    #[test]
    fn frame_layout() {
        let mut list = FiberList::new();
        list.push(Fiber::new(0).unwrap()).unwrap();
        list.push(Fiber::new(4).unwrap()).unwrap();

        let mut readings = [0u16; NUM_FIBERS];
        readings[0] = 7;
        readings[4] = 33000;
        assert_eq!(coupling_frame(&list, &readings), "coupling:F1C7F5C33000\n");

        let mut bank = PiezoBank::new();
        bank.set_bias(Fiber::new(0).unwrap(), 100, 200).unwrap();
        bank.set_bias(Fiber::new(4).unwrap(), 32768, 32768).unwrap();
        assert_eq!(bias_frame(&list, &bank), "bias:F1L100R200F5L32768R32768\n");
    }

    #[test]
    fn empty_lists_still_frame() {
        let list = FiberList::new();
        assert_eq!(coupling_frame(&list, &[0; NUM_FIBERS]), "coupling:\n");
        assert_eq!(bias_frame(&list, &PiezoBank::new()), "bias:\n");
    }
}
