// Emulator — an in-process stand-in for the device runtime
//
// Runs the same programs as the CUDA runtime without a GPU, for tests and
// for machines without a driver. Each kernel declares an emulated body next
// to its CUDA source; the emulator runs that body once per work item.
//
// The runtime model is kept: memory is only reachable through buffer
// handles, one queue thread executes commands strictly in submission order,
// launches return once enqueued, and reads and `finish` block until the
// queue reaches them. Work-groups of a launch run in parallel on the rayon
// pool; items inside a group run in order.
//
// A kernel fault does not panic the queue. The first fault is recorded,
// later launches and writes are skipped, and the fault is delivered (and
// cleared) by the next read or finish.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use rayon::prelude::*;
use tracing::{debug, trace};
use vela_core::{DeviceError, Result};

use crate::buffer::RawBuffer;
use crate::kernel::{KernelArg, Launch};
use crate::runtime::Memory;

// Cells — emulated device memory

/// Result of a cell access from an emulated kernel body.
pub type Access<T> = std::result::Result<T, AccessFault>;

/// A fault raised by an emulated kernel body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// Index past the end of a buffer.
    OutOfRange { buffer: u64, index: usize, len: usize },
    /// Argument missing or of the wrong kind at this position.
    Argument { position: usize },
    /// An operation/activation code the kernel does not know.
    Code { value: i32 },
}

impl fmt::Display for AccessFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessFault::OutOfRange { buffer, index, len } => write!(
                f,
                "access at {index} outside buffer #{buffer} of {len} elements"
            ),
            AccessFault::Argument { position } => write!(f, "bad argument at position {position}"),
            AccessFault::Code { value } => write!(f, "unknown operation code {value}"),
        }
    }
}

/// The memory of one emulated buffer. Cells are atomics so every work item
/// of a launch may read and write through a shared reference; kernels are
/// written so that no two items store to the same cell, and `add_f32`
/// covers the cases that accumulate.
pub struct Cells {
    buffer: u64,
    cells: Box<[AtomicU32]>,
}

impl Cells {
    pub(crate) fn new(buffer: u64, bits: impl Iterator<Item = u32>) -> Self {
        Cells {
            buffer,
            cells: bits.map(AtomicU32::new).collect(),
        }
    }

    #[inline(always)]
    fn cell(&self, index: usize) -> Access<&AtomicU32> {
        self.cells.get(index).ok_or(AccessFault::OutOfRange {
            buffer: self.buffer,
            index,
            len: self.cells.len(),
        })
    }

    #[inline(always)]
    pub fn load_bits(&self, index: usize) -> Access<u32> {
        Ok(self.cell(index)?.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn store_bits(&self, index: usize, bits: u32) -> Access<()> {
        self.cell(index)?.store(bits, Ordering::Relaxed);
        Ok(())
    }

    #[inline(always)]
    pub fn load(&self, index: usize) -> Access<f32> {
        self.load_bits(index).map(f32::from_bits)
    }

    #[inline(always)]
    pub fn store(&self, index: usize, value: f32) -> Access<()> {
        self.store_bits(index, value.to_bits())
    }

    /// Index-buffer read, as a non-negative offset.
    #[inline(always)]
    pub fn index(&self, index: usize) -> Access<usize> {
        Ok(self.load_bits(index)? as i32 as usize)
    }

    /// Atomic `cell += value`.
    pub fn add_f32(&self, index: usize, value: f32) -> Access<()> {
        let cell = self.cell(index)?;
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(seen) => current = seen,
            }
        }
    }

    fn read_range(&self, offset: usize, len: usize) -> Access<Vec<u32>> {
        (offset..offset + len).map(|i| self.load_bits(i)).collect()
    }
}

fn cells(raw: &RawBuffer) -> Option<&Cells> {
    match raw.memory() {
        Memory::Emulated(c) => Some(c),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

// Work items and arguments as seen by an emulated body

/// Position of one work item in the launch grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub global: [usize; 3],
    pub local: [usize; 3],
    pub group: [usize; 3],
}

impl WorkItem {
    #[inline(always)]
    pub fn id(&self, dim: usize) -> usize {
        self.global[dim]
    }
}

/// Emulated kernel body: runs once per work item.
pub type KernelFn = fn(&WorkItem, &Args<'_>) -> Access<()>;

/// Argument accessors for emulated bodies. Positions follow the kernel's
/// declaration; the factory has already checked kinds and count.
pub struct Args<'a> {
    args: &'a [KernelArg],
}

impl<'a> Args<'a> {
    #[inline(always)]
    pub fn buffer(&self, position: usize) -> Access<&'a Cells> {
        match self.args.get(position) {
            Some(KernelArg::Buffer(b)) => cells(b).ok_or(AccessFault::Argument { position }),
            _ => Err(AccessFault::Argument { position }),
        }
    }

    #[inline(always)]
    pub fn int(&self, position: usize) -> Access<i32> {
        match self.args.get(position) {
            Some(KernelArg::Int(v)) => Ok(*v),
            _ => Err(AccessFault::Argument { position }),
        }
    }

    /// An int argument used as a size or offset.
    #[inline(always)]
    pub fn usize(&self, position: usize) -> Access<usize> {
        Ok(self.int(position)?.max(0) as usize)
    }

    #[inline(always)]
    pub fn float(&self, position: usize) -> Access<f32> {
        match self.args.get(position) {
            Some(KernelArg::Float(v)) => Ok(*v),
            _ => Err(AccessFault::Argument { position }),
        }
    }
}

fn execute(launch: &Launch) -> std::result::Result<(), DeviceError> {
    let (global, local) = (launch.global(), launch.local());
    let groups = [
        global[0] / local[0],
        global[1] / local[1],
        global[2] / local[2],
    ];
    let total = groups[0] * groups[1] * groups[2];
    let args = Args { args: launch.args() };
    let body = launch.def().emulated;
    (0..total)
        .into_par_iter()
        .try_for_each(|g| {
            let group = [
                g % groups[0],
                (g / groups[0]) % groups[1],
                g / (groups[0] * groups[1]),
            ];
            for lz in 0..local[2] {
                for ly in 0..local[1] {
                    for lx in 0..local[0] {
                        let item = WorkItem {
                            global: [
                                group[0] * local[0] + lx,
                                group[1] * local[1] + ly,
                                group[2] * local[2] + lz,
                            ],
                            local: [lx, ly, lz],
                            group,
                        };
                        body(&item, &args)?;
                    }
                }
            }
            Ok(())
        })
        .map_err(|f: AccessFault| DeviceError::KernelFault {
            kernel: launch.name().to_string(),
            reason: f.to_string(),
        })
}

// Emulator — the in-order command queue

enum Command {
    Launch(Launch),
    Write {
        buffer: Arc<RawBuffer>,
        offset: usize,
        data: Vec<u32>,
    },
    Read {
        buffer: Arc<RawBuffer>,
        offset: usize,
        len: usize,
        reply: Sender<std::result::Result<Vec<u32>, DeviceError>>,
    },
    Finish {
        reply: Sender<std::result::Result<(), DeviceError>>,
    },
    Shutdown,
}

pub struct Emulator {
    sender: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Emulator {
    pub(crate) fn spawn(label: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let name = format!("{label}-queue");
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(receiver))
            .map_err(|e| DeviceError::QueueLost(format!("failed to start {name}: {e}")))?;
        Ok(Emulator {
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn alloc(&self, id: u64, bits: impl Iterator<Item = u32>) -> Memory {
        Memory::Emulated(Cells::new(id, bits))
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| DeviceError::QueueLost("queue thread has exited".into()))?;
        Ok(())
    }

    pub(crate) fn launch(&self, launch: Launch) -> Result<()> {
        self.submit(Command::Launch(launch))
    }

    pub(crate) fn write(&self, buffer: &Arc<RawBuffer>, offset: usize, data: Vec<u32>) -> Result<()> {
        self.submit(Command::Write {
            buffer: Arc::clone(buffer),
            offset,
            data,
        })
    }

    pub(crate) fn read(&self, buffer: &Arc<RawBuffer>, offset: usize, len: usize) -> Result<Vec<u32>> {
        let (reply, wait) = mpsc::channel();
        self.submit(Command::Read {
            buffer: Arc::clone(buffer),
            offset,
            len,
            reply,
        })?;
        let data = wait
            .recv()
            .map_err(|_| DeviceError::QueueLost("read was dropped".into()))??;
        Ok(data)
    }

    /// Block until every command submitted so far has executed.
    pub(crate) fn finish(&self) -> Result<()> {
        let (reply, wait) = mpsc::channel();
        self.submit(Command::Finish { reply })?;
        wait.recv()
            .map_err(|_| DeviceError::QueueLost("finish was dropped".into()))??;
        Ok(())
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }
}

fn host_fault(op: &str, fault: AccessFault) -> DeviceError {
    DeviceError::KernelFault {
        kernel: op.into(),
        reason: fault.to_string(),
    }
}

fn run(commands: Receiver<Command>) {
    let mut fault: Option<DeviceError> = None;
    while let Ok(command) = commands.recv() {
        match command {
            Command::Launch(launch) => {
                if fault.is_some() {
                    trace!(kernel = launch.name(), "skipped after fault");
                    continue;
                }
                if let Err(e) = execute(&launch) {
                    debug!(error = %e, "kernel fault captured");
                    fault = Some(e);
                }
            }
            Command::Write {
                buffer,
                offset,
                data,
            } => {
                if fault.is_some() {
                    continue;
                }
                let Some(target) = cells(&buffer) else {
                    continue;
                };
                for (k, bits) in data.into_iter().enumerate() {
                    if let Err(f) = target.store_bits(offset + k, bits) {
                        fault = Some(host_fault("write", f));
                        break;
                    }
                }
            }
            Command::Read {
                buffer,
                offset,
                len,
                reply,
            } => {
                let result = match (fault.take(), cells(&buffer)) {
                    (Some(e), _) => Err(e),
                    (None, Some(source)) => source
                        .read_range(offset, len)
                        .map_err(|f| host_fault("read", f)),
                    (None, None) => Err(DeviceError::DeviceMismatch),
                };
                let _ = reply.send(result);
            }
            Command::Finish { reply } => {
                let _ = reply.send(fault.take().map_or(Ok(()), Err));
            }
            Command::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_fault_past_the_end() {
        let c = Cells::new(7, [1.0f32.to_bits(), 2.0f32.to_bits()].into_iter());
        assert_eq!(c.load(1), Ok(2.0));
        assert_eq!(
            c.store(2, 0.0),
            Err(AccessFault::OutOfRange {
                buffer: 7,
                index: 2,
                len: 2
            })
        );
        c.add_f32(0, 0.5).unwrap();
        assert_eq!(c.load(0), Ok(1.5));
    }
}
