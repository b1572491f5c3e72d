mod index_page;

pub use index_page::{
    internal_slot_capacity, leaf_slot_capacity, BPlusTreeHeaderPage, BPlusTreeInternalPage,
    BPlusTreeInternalPageHeader, BPlusTreeLeafPage, BPlusTreeLeafPageHeader, BPlusTreePage,
    BPlusTreePageType,
};

use crate::buffer::PageId;
use crate::error::CorvusResult;
use crate::storage::codec::{CommonCodec, DecodedData, Storable};

/// Location of a tuple in its table heap: page plus slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl RecordId {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl Storable for RecordId {
    const SIZE: usize = 8;

    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend(CommonCodec::encode_u32(self.page_id));
        bytes.extend(CommonCodec::encode_u32(self.slot_num));
        bytes
    }

    fn decode(bytes: &[u8]) -> CorvusResult<DecodedData<Self>> {
        let (page_id, offset) = CommonCodec::decode_u32(bytes)?;
        let (slot_num, offset2) = CommonCodec::decode_u32(&bytes[offset..])?;
        Ok((RecordId { page_id, slot_num }, offset + offset2))
    }
}
