//! Simulated SM500 instrument
//!
//! Stands in for the FPGA behind the register port: a byte-addressed register
//! window, a DMA engine writing into buffers obtained from a [`HeapAllocator`],
//! a serial-number counter and an interrupt line. Completions are driven
//! explicitly by the caller so tests control exactly what the hardware does.
//!
//! [`HeapAllocator`]: dma_pool::HeapAllocator

mod fpga;
mod line;

pub use fpga::{SimConfig, SimulatedFpga};
pub use line::SimInterruptLine;
