//! Pure transformations for the polling path: grouping a poll group's
//! registers into contiguous Modbus read blocks, and normalizing engineering
//! addresses into zero-based wire addresses.
//!
//! Nothing in this crate touches the network, the clock, or the filesystem,
//! so every property in it is tested by plain `#[test]` cases over in-memory
//! data (spec §8 boundary behaviors).

use thiserror::Error;
use types::Register;

/// Modbus FC3 protocol ceiling: the largest register count a single read can request.
pub const DEFAULT_MAX_BLOCK_SIZE: u16 = 125;

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("register address {0} does not fit the normalized wire range")]
    AddressOverflow(u32),
}

/// One contiguous block of registers to read in a single Modbus request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadCommand {
    /// Normalized, zero-based start address to issue on the wire.
    pub start_address: u16,
    pub count: u16,
    pub registers: Vec<Register>,
}

/// Groups `registers` into [`ReadCommand`]s such that within a block
/// addresses are strictly contiguous and no block exceeds `max_block_size`.
///
/// Registers are sorted by engineering address ascending; ties preserve
/// input order (stable sort). An empty input yields an empty output.
pub fn optimize(registers: &[Register], max_block_size: u16) -> Result<Vec<ReadCommand>, OptimizerError> {
    if registers.is_empty() {
        return Ok(Vec::new());
    }

    let mut sorted: Vec<&Register> = registers.iter().collect();
    sorted.sort_by_key(|r| r.address);

    let max_block_size = max_block_size.max(1);
    let mut commands = Vec::new();
    let mut block: Vec<&Register> = Vec::new();

    for register in sorted {
        let starts_new_block = match block.last() {
            None => false,
            Some(prev) => {
                let contiguous = register.address == prev.address + 1;
                !contiguous || block.len() as u16 >= max_block_size
            }
        };

        if starts_new_block {
            commands.push(finish_block(block)?);
            block = Vec::new();
        }

        block.push(register);
    }

    if !block.is_empty() {
        commands.push(finish_block(block)?);
    }

    Ok(commands)
}

fn finish_block(block: Vec<&Register>) -> Result<ReadCommand, OptimizerError> {
    let first = block[0];
    let start_address = normalize_address(first.address)?;
    let count = block.len() as u16;
    Ok(ReadCommand {
        start_address,
        count,
        registers: block.into_iter().cloned().collect(),
    })
}

/// Normalizes an engineering-notation address into the zero-based address
/// issued on the wire (spec §4.2). `count` is never affected by this mapping.
pub fn normalize_address(address: u32) -> Result<u16, OptimizerError> {
    let normalized = if (40_001..=49_999).contains(&address) {
        address - 40_001
    } else if (30_001..=39_999).contains(&address) {
        address - 30_001
    } else if address > 0 {
        address - 1
    } else {
        address
    };

    u16::try_from(normalized).map_err(|_| OptimizerError::AddressOverflow(address))
}
