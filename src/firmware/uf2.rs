//! UF2 image structure checks.
//!
//! A UF2 file is a sequence of 512-byte blocks; each block carries two
//! start magics, a payload of at most 476 bytes and an end magic.

pub const BLOCK_SIZE: usize = 512;
const MAX_PAYLOAD: u32 = 476;

const MAGIC_START0: u32 = 0x0A32_4655;
const MAGIC_START1: u32 = 0x9E5D_5157;
const MAGIC_END: u32 = 0x0AB1_6F30;
const FLAG_FAMILY_ID: u32 = 0x0000_2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uf2Summary {
    pub blocks: u32,
    pub payload_bytes: u64,
    pub family_id: Option<u32>,
}

fn word(block: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([block[offset], block[offset + 1], block[offset + 2], block[offset + 3]])
}

/// Checks that `image` is a well-formed UF2 file and summarizes it.
pub fn validate(image: &[u8]) -> Result<Uf2Summary, String> {
    if image.is_empty() {
        return Err("image is empty".to_string());
    }
    if image.len() % BLOCK_SIZE != 0 {
        return Err(format!(
            "image length {} is not a multiple of {} bytes",
            image.len(),
            BLOCK_SIZE
        ));
    }

    let mut summary = Uf2Summary {
        blocks: 0,
        payload_bytes: 0,
        family_id: None,
    };

    for (index, block) in image.chunks_exact(BLOCK_SIZE).enumerate() {
        if word(block, 0) != MAGIC_START0 || word(block, 4) != MAGIC_START1 {
            return Err(format!("block {} has bad start magic", index));
        }
        if word(block, BLOCK_SIZE - 4) != MAGIC_END {
            return Err(format!("block {} has bad end magic", index));
        }

        let flags = word(block, 8);
        let payload = word(block, 16);
        let block_no = word(block, 20);
        let num_blocks = word(block, 24);

        if payload > MAX_PAYLOAD {
            return Err(format!("block {} payload of {} bytes is too large", index, payload));
        }
        if block_no >= num_blocks {
            return Err(format!("block {} claims number {} of {}", index, block_no, num_blocks));
        }
        if flags & FLAG_FAMILY_ID != 0 {
            summary.family_id.get_or_insert(word(block, 28));
        }

        summary.blocks += 1;
        summary.payload_bytes += u64::from(payload);
    }

    Ok(summary)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a valid image of `count` blocks with 256-byte payloads.
    pub(crate) fn image(count: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(count as usize * BLOCK_SIZE);
        for n in 0..count {
            let mut block = vec![0u8; BLOCK_SIZE];
            block[0..4].copy_from_slice(&MAGIC_START0.to_le_bytes());
            block[4..8].copy_from_slice(&MAGIC_START1.to_le_bytes());
            block[8..12].copy_from_slice(&FLAG_FAMILY_ID.to_le_bytes());
            block[12..16].copy_from_slice(&(0x1000_0000 + n * 256).to_le_bytes());
            block[16..20].copy_from_slice(&256u32.to_le_bytes());
            block[20..24].copy_from_slice(&n.to_le_bytes());
            block[24..28].copy_from_slice(&count.to_le_bytes());
            block[28..32].copy_from_slice(&0xE48B_FF56u32.to_le_bytes());
            block[BLOCK_SIZE - 4..].copy_from_slice(&MAGIC_END.to_le_bytes());
            out.extend(block);
        }
        out
    }

    #[test]
    fn accepts_well_formed_image() {
        let summary = validate(&image(3)).unwrap();
        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.payload_bytes, 768);
        assert_eq!(summary.family_id, Some(0xE48B_FF56));
    }

    #[test]
    fn rejects_partial_blocks_and_bad_magic() {
        let mut short = image(2);
        short.truncate(700);
        assert!(validate(&short).unwrap_err().contains("multiple"));

        let mut corrupt = image(2);
        corrupt[BLOCK_SIZE] ^= 0xFF;
        assert!(validate(&corrupt).unwrap_err().contains("block 1"));

        let mut tail = image(1);
        tail[BLOCK_SIZE - 1] = 0;
        assert!(validate(&tail).unwrap_err().contains("end magic"));

        assert!(validate(b"<html>not found</html>").is_err());
        assert!(validate(&[]).is_err());
    }
}
