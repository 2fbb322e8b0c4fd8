use core::fmt::{Debug, Formatter};

/// A received classic CAN frame: arbitration id plus up to 8 payload bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration id of the frame
    pub id: embedded_can::Id,
    /// Payload bytes, length equals the wire dlc
    pub data: heapless::Vec<u8, { Self::MAX_LEN }>,
}

impl CanFrame {
    const MAX_LEN: usize = 8;

    /// Wrap an already received frame
    pub fn from_encoded(id: embedded_can::Id, data: &[u8]) -> Self {
        Self {
            id,
            data: heapless::Vec::from_slice(data).expect("Data length exceeds MAX_LEN"),
        }
    }

    /// The 11-bit arbitration id, or `None` for extended frames.
    ///
    /// The U-BMS speaks standard ids only, so extended frames are never
    /// classified.
    pub fn standard_id(&self) -> Option<u16> {
        match self.id {
            embedded_can::Id::Standard(id) => Some(id.as_raw()),
            embedded_can::Id::Extended(_) => None,
        }
    }
}

#[cfg(feature = "arbitrary")]
use embedded_can::{ExtendedId, StandardId};
#[cfg(feature = "arbitrary")]
impl arbitrary::Arbitrary<'_> for CanFrame {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let id: u32 = u.int_in_range(0..=0x1FFFFFFF)?;
        let id = if id <= 0x7FF {
            embedded_can::Id::Standard(StandardId::new(id as u16).unwrap())
        } else {
            embedded_can::Id::Extended(ExtendedId::new(id).unwrap())
        };
        let data_len = u.int_in_range(0..=Self::MAX_LEN as u8)?;
        let mut data = heapless::Vec::new();
        for _ in 0..data_len {
            data.push(u.int_in_range(0..=255)?)
                .expect("Data length exceeds MAX_LEN");
        }
        Ok(Self { id, data })
    }
}

impl Debug for CanFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self.id {
            embedded_can::Id::Standard(s) => write!(f, "CanFrame {{ id: {:#05X}, data: [", s.as_raw())?,
            embedded_can::Id::Extended(e) => write!(f, "CanFrame {{ id: {:#010X}, data: [", e.as_raw())?,
        }
        for (i, byte) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:#04X}", byte)?;
        }
        write!(f, "] }}")
    }
}
