use crate::buffer::PAGE_SIZE;
use crate::error::{CorvusError, CorvusResult};
use crate::storage::codec::{CommonCodec, DecodedData, Storable};
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage, BPlusTreePageType,
};

pub struct BPlusTreeHeaderPageCodec;

impl BPlusTreeHeaderPageCodec {
    pub fn encode(page: &BPlusTreeHeaderPage) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_u32(page.root_page_id);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> CorvusResult<DecodedData<BPlusTreeHeaderPage>> {
        let (root_page_id, offset) = CommonCodec::decode_u32(bytes)?;
        Ok((BPlusTreeHeaderPage { root_page_id }, offset))
    }
}

pub struct BPlusTreePageTypeCodec;

impl BPlusTreePageTypeCodec {
    pub fn encode(page_type: &BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::LeafPage => CommonCodec::encode_u8(1),
            BPlusTreePageType::InternalPage => CommonCodec::encode_u8(2),
        }
    }

    pub fn decode(bytes: &[u8]) -> CorvusResult<DecodedData<BPlusTreePageType>> {
        let (flag, offset) = CommonCodec::decode_u8(bytes)?;
        match flag {
            1 => Ok((BPlusTreePageType::LeafPage, offset)),
            2 => Ok((BPlusTreePageType::InternalPage, offset)),
            _ => Err(CorvusError::Internal(format!("Invalid page type {}", flag))),
        }
    }
}

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode<K, V, const TOMBS: usize>(page: &BPlusTreePage<K, V, TOMBS>) -> Vec<u8>
    where
        K: Storable + Default,
        V: Storable,
    {
        match page {
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page),
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page),
        }
    }

    pub fn decode<K, V, const TOMBS: usize>(
        bytes: &[u8],
    ) -> CorvusResult<DecodedData<BPlusTreePage<K, V, TOMBS>>>
    where
        K: Storable + Default,
        V: Storable,
    {
        // peek the type byte without consuming
        let (page_type, _) = BPlusTreePageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
            BPlusTreePageType::InternalPage => {
                let (page, offset) = BPlusTreeInternalPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
        }
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode<K, V, const TOMBS: usize>(page: &BPlusTreeLeafPage<K, V, TOMBS>) -> Vec<u8>
    where
        K: Storable + Default,
        V: Storable,
    {
        debug_assert_eq!(page.array.len(), page.header.current_size as usize);
        let mut bytes = vec![];
        bytes.extend(BPlusTreePageTypeCodec::encode(&page.header.page_type));
        bytes.extend(CommonCodec::encode_u32(page.header.current_size));
        bytes.extend(CommonCodec::encode_u32(page.header.max_size));
        bytes.extend(CommonCodec::encode_u32(page.header.next_page_id));
        bytes.extend(CommonCodec::encode_u32(page.header.prev_page_id));
        bytes.extend(CommonCodec::encode_u32(page.tombstones.len() as u32));
        bytes.extend(CommonCodec::encode_u32(page.parent_page_id));
        bytes.extend(CommonCodec::encode_u32(page.page_id));

        let flags = (page.is_begin as u8)
            | ((page.is_update as u8) << 1)
            | ((page.need_deep_update as u8) << 2);
        bytes.extend(CommonCodec::encode_u8(flags));
        bytes.extend(CommonCodec::encode_bool(page.before_first_key.is_some()));
        match &page.before_first_key {
            Some(key) => bytes.extend(key.encode()),
            None => bytes.extend(K::default().encode()),
        }

        for slot in page.tombstones.iter() {
            bytes.extend(CommonCodec::encode_u32(*slot as u32));
        }
        for (key, value) in page.array.iter() {
            bytes.extend(key.encode());
            bytes.extend(value.encode());
        }

        assert!(bytes.len() <= PAGE_SIZE);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode<K, V, const TOMBS: usize>(
        bytes: &[u8],
    ) -> CorvusResult<DecodedData<BPlusTreeLeafPage<K, V, TOMBS>>>
    where
        K: Storable + Default,
        V: Storable,
    {
        if bytes.len() != PAGE_SIZE {
            return Err(CorvusError::Internal(format!(
                "Index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if !matches!(page_type, BPlusTreePageType::LeafPage) {
            return Err(CorvusError::Internal(
                "Index page type must be leaf page".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];

        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (next_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (prev_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (num_tombstones, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (parent_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (flags, offset) = CommonCodec::decode_u8(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (has_before_first, offset) = CommonCodec::decode_bool(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (before_first, offset) = K::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        if num_tombstones as usize > TOMBS {
            return Err(CorvusError::Internal(format!(
                "Leaf page carries {} tombstones, capacity is {}",
                num_tombstones, TOMBS
            )));
        }
        let mut tombstones = Vec::with_capacity(num_tombstones as usize);
        for _ in 0..num_tombstones {
            let (slot, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            tombstones.push(slot as usize);
        }

        let mut array = Vec::with_capacity(current_size as usize);
        for _ in 0..current_size {
            let (key, offset) = K::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (value, offset) = V::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, value));
        }

        Ok((
            BPlusTreeLeafPage {
                header: BPlusTreeLeafPageHeader {
                    page_type,
                    current_size,
                    max_size,
                    next_page_id,
                    prev_page_id,
                },
                parent_page_id,
                page_id,
                array,
                tombstones,
                before_first_key: if has_before_first {
                    Some(before_first)
                } else {
                    None
                },
                is_begin: flags & 1 != 0,
                is_update: flags & 2 != 0,
                need_deep_update: flags & 4 != 0,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode<K>(page: &BPlusTreeInternalPage<K>) -> Vec<u8>
    where
        K: Storable + Default,
    {
        debug_assert_eq!(page.array.len(), page.header.current_size as usize);
        let mut bytes = vec![];
        bytes.extend(BPlusTreePageTypeCodec::encode(&page.header.page_type));
        bytes.extend(CommonCodec::encode_u32(page.header.current_size));
        bytes.extend(CommonCodec::encode_u32(page.header.max_size));
        bytes.extend(CommonCodec::encode_u32(page.parent_page_id));
        bytes.extend(CommonCodec::encode_u32(page.page_id));
        for (key, child) in page.array.iter() {
            bytes.extend(key.encode());
            bytes.extend(CommonCodec::encode_u32(*child));
        }

        assert!(bytes.len() <= PAGE_SIZE);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode<K>(bytes: &[u8]) -> CorvusResult<DecodedData<BPlusTreeInternalPage<K>>>
    where
        K: Storable + Default,
    {
        if bytes.len() != PAGE_SIZE {
            return Err(CorvusError::Internal(format!(
                "Index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if !matches!(page_type, BPlusTreePageType::InternalPage) {
            return Err(CorvusError::Internal(
                "Index page type must be internal page".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];

        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (parent_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(current_size as usize);
        for _ in 0..current_size {
            let (key, offset) = K::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (child, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, child));
        }

        Ok((
            BPlusTreeInternalPage {
                header: BPlusTreeInternalPageHeader {
                    page_type,
                    current_size,
                    max_size,
                },
                parent_page_id,
                page_id,
                array,
            },
            PAGE_SIZE,
        ))
    }
}
