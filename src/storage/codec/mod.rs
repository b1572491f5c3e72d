use crate::error::{CorvusError, CorvusResult};

mod index_page;

pub use index_page::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec, BPlusTreePageTypeCodec,
};

// data + consumed offset
pub type DecodedData<T> = (T, usize);

/// Fixed-width wire form for index keys and values. Everything stored inside
/// a B+tree page goes through this trait, so node layout stays private to
/// the codecs.
pub trait Storable: Sized + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Encoded width in bytes. Must be the exact number of bytes produced by
    /// `encode` and consumed by `decode`.
    const SIZE: usize;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> CorvusResult<DecodedData<Self>>;
}

macro_rules! impl_storable_for_int {
    ($t:ty, $decode_fn:ident) => {
        impl Storable for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn encode(&self) -> Vec<u8> {
                self.to_be_bytes().to_vec()
            }

            fn decode(bytes: &[u8]) -> CorvusResult<DecodedData<Self>> {
                CommonCodec::$decode_fn(bytes)
            }
        }
    };
}

impl_storable_for_int!(u32, decode_u32);
impl_storable_for_int!(u64, decode_u64);
impl_storable_for_int!(i32, decode_i32);
impl_storable_for_int!(i64, decode_i64);

pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_bool(data: bool) -> Vec<u8> {
        vec![data as u8]
    }

    pub fn decode_bool(bytes: &[u8]) -> CorvusResult<DecodedData<bool>> {
        if bytes.is_empty() {
            return Err(CorvusError::Internal(
                "bytes length 0 is less than 1".to_string(),
            ));
        }
        Ok((bytes[0] != 0, 1))
    }

    pub fn encode_u8(data: u8) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u8(bytes: &[u8]) -> CorvusResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(CorvusError::Internal(
                "bytes length 0 is less than 1".to_string(),
            ));
        }
        Ok((bytes[0], 1))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> CorvusResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(CorvusError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_be_bytes(data), 4))
    }

    pub fn encode_u64(data: u64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u64(bytes: &[u8]) -> CorvusResult<DecodedData<u64>> {
        if bytes.len() < 8 {
            return Err(CorvusError::Internal(format!(
                "bytes length {} is less than 8",
                bytes.len()
            )));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[0..8]);
        Ok((u64::from_be_bytes(data), 8))
    }

    pub fn encode_i32(data: i32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i32(bytes: &[u8]) -> CorvusResult<DecodedData<i32>> {
        if bytes.len() < 4 {
            return Err(CorvusError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((i32::from_be_bytes(data), 4))
    }

    pub fn encode_i64(data: i64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i64(bytes: &[u8]) -> CorvusResult<DecodedData<i64>> {
        if bytes.len() < 8 {
            return Err(CorvusError::Internal(format!(
                "bytes length {} is less than 8",
                bytes.len()
            )));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[0..8]);
        Ok((i64::from_be_bytes(data), 8))
    }
}
