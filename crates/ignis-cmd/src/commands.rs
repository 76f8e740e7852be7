//! # Command Encoding
//!
//! The GPU commands a command-stream receiver emits, with a compact dword
//! encoding and a decoder for inspection.
//!
//! Every command starts with a header dword:
//!
//! ```text
//! [31:24] opcode   [23:16] command flags   [7:0] length in dwords
//! ```

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use ignis_core::{Error, GpuAddr, Result};

use crate::dispatch::ThreadArbitrationPolicy;
use crate::stream::LinearStream;

/// Longest command in dwords
pub const MAX_COMMAND_DWORDS: usize = 9;

/// Command opcodes
pub mod opcode {
    /// MI_NOOP
    pub const NOOP: u8 = 0x00;
    /// MI_BATCH_BUFFER_END
    pub const BATCH_BUFFER_END: u8 = 0x0A;
    /// MI_SEMAPHORE_WAIT
    pub const SEMAPHORE_WAIT: u8 = 0x1C;
    /// MI_LOAD_REGISTER_IMM
    pub const LOAD_REGISTER_IMM: u8 = 0x22;
    /// MI_BATCH_BUFFER_START
    pub const BATCH_BUFFER_START: u8 = 0x31;
    /// STATE_BASE_ADDRESS
    pub const STATE_BASE_ADDRESS: u8 = 0x61;
    /// PIPELINE_SELECT
    pub const PIPELINE_SELECT: u8 = 0x69;
    /// STATE_COMPUTE_MODE
    pub const STATE_COMPUTE_MODE: u8 = 0x73;
    /// PIPE_CONTROL
    pub const PIPE_CONTROL: u8 = 0x7A;
    /// CFE_STATE
    pub const CFE_STATE: u8 = 0x7B;
}

/// Register holding the preemption mode
pub const PREEMPTION_CONTROL_REGISTER: u32 = 0x2580;

// =============================================================================
// COMMAND FIELDS
// =============================================================================

bitflags::bitflags! {
    /// PIPE_CONTROL operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeControlFlags: u32 {
        /// Stall the command streamer until prior work completes
        const CS_STALL = 1 << 0;
        /// Flush the data cache
        const DC_FLUSH = 1 << 1;
        /// Invalidate the texture cache
        const TEXTURE_CACHE_INVALIDATE = 1 << 2;
        /// Flush the HDC pipeline
        const HDC_PIPELINE_FLUSH = 1 << 3;
        /// Write immediate data after the flush
        const POST_SYNC_WRITE = 1 << 4;
    }
}

/// Immediate write performed by a PIPE_CONTROL once it retires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostSyncWrite {
    /// Destination
    pub address: GpuAddr,
    /// Value written
    pub value: u64,
}

/// MI_SEMAPHORE_WAIT comparison between memory (SAD) and data (SDD)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreCompare {
    /// SAD > SDD
    GreaterThan,
    /// SAD >= SDD
    GreaterThanOrEqual,
    /// SAD < SDD
    LessThan,
    /// SAD <= SDD
    LessThanOrEqual,
    /// SAD == SDD
    Equal,
    /// SAD != SDD
    NotEqual,
}

impl SemaphoreCompare {
    const fn encode(self) -> u32 {
        match self {
            Self::GreaterThan => 0,
            Self::GreaterThanOrEqual => 1,
            Self::LessThan => 2,
            Self::LessThanOrEqual => 3,
            Self::Equal => 4,
            Self::NotEqual => 5,
        }
    }

    fn decode(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::GreaterThan,
            1 => Self::GreaterThanOrEqual,
            2 => Self::LessThan,
            3 => Self::LessThanOrEqual,
            4 => Self::Equal,
            5 => Self::NotEqual,
            _ => return Err(Error::InvalidCommand),
        })
    }
}

fn encode_arbitration(policy: Option<ThreadArbitrationPolicy>) -> u32 {
    match policy {
        None => 0,
        Some(ThreadArbitrationPolicy::AgeBased) => 1,
        Some(ThreadArbitrationPolicy::RoundRobin) => 2,
        Some(ThreadArbitrationPolicy::RoundRobinAfterDependency) => 3,
    }
}

fn decode_arbitration(raw: u32) -> Result<Option<ThreadArbitrationPolicy>> {
    Ok(match raw {
        0 => None,
        1 => Some(ThreadArbitrationPolicy::AgeBased),
        2 => Some(ThreadArbitrationPolicy::RoundRobin),
        3 => Some(ThreadArbitrationPolicy::RoundRobinAfterDependency),
        _ => return Err(Error::InvalidCommand),
    })
}

// =============================================================================
// COMMAND
// =============================================================================

/// A GPU command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// No operation
    Noop,
    /// End of the current batch buffer
    BatchBufferEnd,
    /// Jump into another batch buffer
    BatchBufferStart {
        /// Target address
        address: GpuAddr,
        /// Return to the caller at the target's batch-buffer end
        second_level: bool,
    },
    /// Load a register with an immediate value
    LoadRegisterImm {
        /// MMIO offset
        register: u32,
        /// Value
        value: u32,
    },
    /// Poll memory until the comparison holds
    SemaphoreWait {
        /// Polled address
        address: GpuAddr,
        /// Compared data
        data: u32,
        /// Comparison
        compare: SemaphoreCompare,
    },
    /// Pipeline flush with an optional post-sync write
    PipeControl {
        /// Flush operations
        flags: PipeControlFlags,
        /// Post-sync write
        post_sync: Option<PostSyncWrite>,
    },
    /// Select the GPGPU or 3D pipeline
    PipelineSelect {
        /// GPGPU pipeline
        gpgpu: bool,
    },
    /// Heap base addresses
    StateBaseAddress {
        /// General state base (legacy scratch addressing)
        general_state: GpuAddr,
        /// Surface state base
        surface_state: GpuAddr,
        /// Dynamic state base
        dynamic_state: GpuAddr,
        /// Indirect object base
        indirect_object: GpuAddr,
    },
    /// Compute front-end state
    CfeState {
        /// Offset of the scratch descriptor in the surface-state heap
        scratch_space_buffer: u32,
        /// Maximum concurrent threads
        maximum_threads: u32,
    },
    /// Compute mode state
    StateComputeMode {
        /// Coherent memory access
        coherency_required: bool,
        /// 256 GRF mode
        large_grf: bool,
        /// Thread arbitration policy
        thread_arbitration: Option<ThreadArbitrationPolicy>,
    },
}

fn header(opcode: u8, flags: u32, length: usize) -> u32 {
    ((opcode as u32) << 24) | ((flags & 0xFF) << 16) | (length as u32 & 0xFF)
}

fn split(addr: GpuAddr) -> [u32; 2] {
    [addr.raw() as u32, (addr.raw() >> 32) as u32]
}

fn join(lo: u32, hi: u32) -> GpuAddr {
    GpuAddr::new(lo as u64 | ((hi as u64) << 32))
}

impl Command {
    /// Encode to dwords
    pub fn encode(&self) -> ArrayVec<u32, MAX_COMMAND_DWORDS> {
        let mut out = ArrayVec::new();
        match *self {
            Self::Noop => out.push(header(opcode::NOOP, 0, 1)),
            Self::BatchBufferEnd => out.push(header(opcode::BATCH_BUFFER_END, 0, 1)),
            Self::BatchBufferStart {
                address,
                second_level,
            } => {
                out.push(header(opcode::BATCH_BUFFER_START, second_level as u32, 3));
                out.extend(split(address));
            }
            Self::LoadRegisterImm { register, value } => {
                out.push(header(opcode::LOAD_REGISTER_IMM, 0, 3));
                out.push(register);
                out.push(value);
            }
            Self::SemaphoreWait {
                address,
                data,
                compare,
            } => {
                out.push(header(opcode::SEMAPHORE_WAIT, compare.encode(), 4));
                out.push(data);
                out.extend(split(address));
            }
            Self::PipeControl { flags, post_sync } => {
                out.push(header(opcode::PIPE_CONTROL, 0, 6));
                let write = post_sync.unwrap_or(PostSyncWrite {
                    address: GpuAddr::null(),
                    value: 0,
                });
                let mut flags = flags - PipeControlFlags::POST_SYNC_WRITE;
                if post_sync.is_some() {
                    flags |= PipeControlFlags::POST_SYNC_WRITE;
                }
                out.push(flags.bits());
                out.extend(split(write.address));
                out.push(write.value as u32);
                out.push((write.value >> 32) as u32);
            }
            Self::PipelineSelect { gpgpu } => {
                out.push(header(opcode::PIPELINE_SELECT, gpgpu as u32, 1));
            }
            Self::StateBaseAddress {
                general_state,
                surface_state,
                dynamic_state,
                indirect_object,
            } => {
                out.push(header(opcode::STATE_BASE_ADDRESS, 0, 9));
                out.extend(split(general_state));
                out.extend(split(surface_state));
                out.extend(split(dynamic_state));
                out.extend(split(indirect_object));
            }
            Self::CfeState {
                scratch_space_buffer,
                maximum_threads,
            } => {
                out.push(header(opcode::CFE_STATE, 0, 3));
                out.push(scratch_space_buffer);
                out.push(maximum_threads);
            }
            Self::StateComputeMode {
                coherency_required,
                large_grf,
                thread_arbitration,
            } => {
                out.push(header(opcode::STATE_COMPUTE_MODE, 0, 2));
                out.push(
                    coherency_required as u32
                        | ((large_grf as u32) << 1)
                        | (encode_arbitration(thread_arbitration) << 4),
                );
            }
        }
        out
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        let dwords = match self {
            Self::Noop | Self::BatchBufferEnd | Self::PipelineSelect { .. } => 1,
            Self::StateComputeMode { .. } => 2,
            Self::BatchBufferStart { .. } | Self::LoadRegisterImm { .. } | Self::CfeState { .. } => 3,
            Self::SemaphoreWait { .. } => 4,
            Self::PipeControl { .. } => 6,
            Self::StateBaseAddress { .. } => 9,
        };
        dwords * 4
    }

    /// Append to a stream
    pub fn write_to(&self, stream: &mut LinearStream) -> Result<()> {
        stream.write_dwords(&self.encode())
    }

    /// Decode one command from the front of `dwords`
    ///
    /// Returns the command and the number of dwords consumed.
    pub fn decode(dwords: &[u32]) -> Result<(Self, usize)> {
        let head = *dwords.first().ok_or(Error::InvalidCommand)?;
        let op = (head >> 24) as u8;
        let flags = (head >> 16) & 0xFF;
        let length = (head & 0xFF) as usize;

        if length == 0 || length > dwords.len() {
            return Err(Error::InvalidCommand);
        }
        let d = &dwords[..length];

        let expect = |n: usize| -> Result<()> {
            if length == n {
                Ok(())
            } else {
                Err(Error::InvalidCommand)
            }
        };

        let command = match op {
            opcode::NOOP => {
                expect(1)?;
                Self::Noop
            }
            opcode::BATCH_BUFFER_END => {
                expect(1)?;
                Self::BatchBufferEnd
            }
            opcode::BATCH_BUFFER_START => {
                expect(3)?;
                Self::BatchBufferStart {
                    address: join(d[1], d[2]),
                    second_level: flags & 1 != 0,
                }
            }
            opcode::LOAD_REGISTER_IMM => {
                expect(3)?;
                Self::LoadRegisterImm {
                    register: d[1],
                    value: d[2],
                }
            }
            opcode::SEMAPHORE_WAIT => {
                expect(4)?;
                Self::SemaphoreWait {
                    address: join(d[2], d[3]),
                    data: d[1],
                    compare: SemaphoreCompare::decode(flags)?,
                }
            }
            opcode::PIPE_CONTROL => {
                expect(6)?;
                let all = PipeControlFlags::from_bits_truncate(d[1]);
                let post_sync = all.contains(PipeControlFlags::POST_SYNC_WRITE).then(|| {
                    PostSyncWrite {
                        address: join(d[2], d[3]),
                        value: d[4] as u64 | ((d[5] as u64) << 32),
                    }
                });
                Self::PipeControl {
                    flags: all - PipeControlFlags::POST_SYNC_WRITE,
                    post_sync,
                }
            }
            opcode::PIPELINE_SELECT => {
                expect(1)?;
                Self::PipelineSelect {
                    gpgpu: flags & 1 != 0,
                }
            }
            opcode::STATE_BASE_ADDRESS => {
                expect(9)?;
                Self::StateBaseAddress {
                    general_state: join(d[1], d[2]),
                    surface_state: join(d[3], d[4]),
                    dynamic_state: join(d[5], d[6]),
                    indirect_object: join(d[7], d[8]),
                }
            }
            opcode::CFE_STATE => {
                expect(3)?;
                Self::CfeState {
                    scratch_space_buffer: d[1],
                    maximum_threads: d[2],
                }
            }
            opcode::STATE_COMPUTE_MODE => {
                expect(2)?;
                Self::StateComputeMode {
                    coherency_required: d[1] & 1 != 0,
                    large_grf: d[1] & 2 != 0,
                    thread_arbitration: decode_arbitration((d[1] >> 4) & 0x7)?,
                }
            }
            _ => return Err(Error::InvalidCommand),
        };

        Ok((command, length))
    }
}

/// Decode a whole command stream
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Command>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidCommand);
    }

    let dwords: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut commands = Vec::new();
    let mut at = 0;
    while at < dwords.len() {
        let (command, length) = Command::decode(&dwords[at..])?;
        commands.push(command);
        at += length;
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_encoded_len_matches_encoding() {
        let commands = [
            Command::Noop,
            Command::BatchBufferEnd,
            Command::BatchBufferStart {
                address: GpuAddr::new(0x1000),
                second_level: true,
            },
            Command::PipeControl {
                flags: PipeControlFlags::CS_STALL,
                post_sync: None,
            },
            Command::StateBaseAddress {
                general_state: GpuAddr::null(),
                surface_state: GpuAddr::new(1),
                dynamic_state: GpuAddr::new(2),
                indirect_object: GpuAddr::new(3),
            },
            Command::StateComputeMode {
                coherency_required: true,
                large_grf: false,
                thread_arbitration: None,
            },
        ];
        for command in &commands {
            assert_eq!(command.encode().len() * 4, command.encoded_len());
        }
    }

    #[test]
    fn test_batch_buffer_end_and_noop_have_same_size() {
        assert_eq!(
            Command::BatchBufferEnd.encoded_len(),
            Command::Noop.encoded_len()
        );
    }

    #[test]
    fn test_pipe_control_post_sync() {
        let command = Command::PipeControl {
            flags: PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH,
            post_sync: Some(PostSyncWrite {
                address: GpuAddr::new(0x1_0000_2000),
                value: 0x1_0000_0007,
            }),
        };
        let dwords = command.encode();
        assert!(PipeControlFlags::from_bits_truncate(dwords[1])
            .contains(PipeControlFlags::POST_SYNC_WRITE));
        let (decoded, length) = Command::decode(&dwords).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(length, 6);
    }

    #[test]
    fn test_decode_stream() {
        let bytes: Vec<u8> = [
            Command::PipelineSelect { gpgpu: true },
            Command::SemaphoreWait {
                address: GpuAddr::new(0x4000),
                data: 1,
                compare: SemaphoreCompare::NotEqual,
            },
            Command::BatchBufferEnd,
        ]
        .iter()
        .flat_map(|c| c.encode())
        .flat_map(u32::to_le_bytes)
        .collect();

        let commands = decode_stream(&bytes).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0], Command::PipelineSelect { gpgpu: true });
        assert!(matches!(
            commands[1],
            Command::SemaphoreWait {
                compare: SemaphoreCompare::NotEqual,
                data: 1,
                ..
            }
        ));
        assert_eq!(commands[2], Command::BatchBufferEnd);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_stream(&[0, 0, 0]).unwrap_err(), Error::InvalidCommand);
        assert_eq!(
            Command::decode(&[0xEE00_0001]).unwrap_err(),
            Error::InvalidCommand
        );
        // truncated LOAD_REGISTER_IMM
        assert_eq!(
            Command::decode(&[header(opcode::LOAD_REGISTER_IMM, 0, 3), 0]).unwrap_err(),
            Error::InvalidCommand
        );
        assert_eq!(decode_stream(&vec![0u8; 4]).unwrap_err(), Error::InvalidCommand);
    }
}
