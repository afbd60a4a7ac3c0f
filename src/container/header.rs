use eyre::{ensure, Result};
use packed_struct::prelude::*;
use ring::digest::{self, SHA256};

#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(endian = "lsb")]
pub struct ContainerFileHeader {
    /// Magic string "BLOCKFS\0"
    pub magic: [u8; 8],
    /// Always 1
    pub version: u32,
    /// Size of a single block in bytes
    pub block_size: u32,
    /// Total blocks in the store, used or not
    pub block_count: u64,
    /// Sum of the sizes of all files
    pub used_size: u64,
    /// Number of set bits in the bitmap,
    /// which is also the number of blocks
    /// stored after it.
    pub used_blocks: u64,
    /// sha256 over everything following
    /// the header.
    pub checksum: [u8; 32],
}

impl ContainerFileHeader {
    pub const SIZE: usize = 72;
    pub const MAGIC: &'static [u8; 8] = b"BLOCKFS\0";
    pub const VERSION: u32 = 1;

    pub fn new(
        block_size: u32,
        block_count: u64,
        used_size: u64,
        used_blocks: u64,
        payload: &[u8],
    ) -> Self {
        Self {
            magic: *Self::MAGIC,
            version: Self::VERSION,
            block_size,
            block_count,
            used_size,
            used_blocks,
            checksum: Self::checksum(payload),
        }
    }

    fn checksum(payload: &[u8]) -> [u8; 32] {
        let mut checksum = [0; 32];
        checksum.copy_from_slice(digest::digest(&SHA256, payload).as_ref());
        checksum
    }

    /// Checks magic, version and that `payload` is what the header was written for.
    pub fn validate(&self, payload: &[u8]) -> Result<()> {
        ensure!(&self.magic == Self::MAGIC, "Bad file magic");
        ensure!(
            self.version == Self::VERSION,
            "Version field in header must be {}, found {}",
            Self::VERSION,
            self.version
        );
        ensure!(
            Self::checksum(payload) == self.checksum,
            "Snapshot checksum mismatch, the file is corrupt"
        );
        ensure!(
            self.used_blocks <= self.block_count,
            "Invalid used block count {}: only {} blocks exist",
            self.used_blocks,
            self.block_count
        );
        Ok(())
    }
}

#[test]
fn test_header_layout() {
    use hex_literal::hex;
    let header = ContainerFileHeader::new(4096, 10240, 5, 1, b"");
    let packed = header.pack().unwrap();
    assert_eq!(packed.len(), ContainerFileHeader::SIZE);
    assert_eq!(
        packed[..40],
        hex!(
            "424c4f434b465300" // magic
            "01000000" // version
            "00100000" // block size
            "0028000000000000" // block count
            "0500000000000000" // used size
            "0100000000000000" // used blocks
        )
    );
    // sha256 of the empty string
    assert_eq!(
        packed[40..],
        hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
    );
    let unpacked = ContainerFileHeader::unpack_from_slice(&packed).unwrap();
    assert_eq!(unpacked, header);
}

#[test]
fn test_validate_rejects_tampering() {
    let header = ContainerFileHeader::new(512, 4, 0, 0, b"payload");
    assert!(header.validate(b"payload").is_ok());
    assert!(header.validate(b"payloaD").is_err());
    let mut wrong_version = ContainerFileHeader::new(512, 4, 0, 0, b"");
    wrong_version.version = 2;
    assert!(wrong_version.validate(b"").is_err());
}
