//! Value codecs.
//!
//! A model point stores its value as a fixed-size byte buffer. The
//! [`ValueCodec`] capability describes how one value type maps onto that
//! buffer and onto the `val` field of the JSON envelope. The point engine is
//! generic over the codec; name-based access (JSON, diagnostics) goes through
//! the erased [`DynCodec`] form.
//!
//! Only thin codecs live here: numeric scalars and booleans. Applications add
//! their own by implementing [`ValueCodec`].

use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Payload capability for one value type.
///
/// `size()` must be constant for the lifetime of the codec: the point's
/// buffer, the export layout and the byte-equality change check all depend
/// on it.
pub trait ValueCodec: Send + Sync + 'static {
    /// The decoded value type.
    type Value: Clone + Send + Sync + 'static;

    /// Type name reported in the verbose JSON envelope.
    fn type_name(&self) -> &str;

    /// Fixed payload size in bytes.
    fn size(&self) -> usize;

    /// Value reported by reads while the point is invalid.
    fn default_value(&self) -> Self::Value;

    /// Encode `value` into `dst`, which is exactly `size()` bytes.
    fn encode(&self, value: &Self::Value, dst: &mut [u8]);

    /// Decode a value from `src`, which is exactly `size()` bytes.
    fn decode(&self, src: &[u8]) -> Self::Value;

    /// Render the `val` field.
    fn to_json(&self, value: &Self::Value) -> Value;

    /// Parse the `val` field. The error string is surfaced to the caller.
    fn from_json(&self, json: &Value) -> Result<Self::Value, String>;
}

/// Object-safe view of a [`ValueCodec`], working on raw payload bytes.
pub trait DynCodec: Send + Sync {
    fn type_name(&self) -> &str;

    fn size(&self) -> usize;

    /// Encoded default value.
    fn default_bytes(&self) -> Vec<u8>;

    fn payload_to_json(&self, payload: &[u8]) -> Value;

    fn payload_from_json(&self, json: &Value) -> Result<Vec<u8>, String>;

    /// Recover the concrete codec type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<C: ValueCodec> DynCodec for C {
    fn type_name(&self) -> &str {
        ValueCodec::type_name(self)
    }

    fn size(&self) -> usize {
        ValueCodec::size(self)
    }

    fn default_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; ValueCodec::size(self)];
        self.encode(&self.default_value(), &mut bytes);
        bytes
    }

    fn payload_to_json(&self, payload: &[u8]) -> Value {
        self.to_json(&self.decode(payload))
    }

    fn payload_from_json(&self, json: &Value) -> Result<Vec<u8>, String> {
        let value = self.from_json(json)?;
        let mut bytes = vec![0u8; ValueCodec::size(self)];
        self.encode(&value, &mut bytes);
        Ok(bytes)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Encode a value into a freshly allocated payload buffer.
pub(crate) fn encode_to_vec<C: ValueCodec>(codec: &C, value: &C::Value) -> Vec<u8> {
    let mut bytes = vec![0u8; codec.size()];
    codec.encode(value, &mut bytes);
    bytes
}

// ============================================================================
// Numeric scalars
// ============================================================================

/// A primitive number that can be stored in a [`Numeric`] point.
pub trait NumericPrimitive: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
    const SIZE: usize;

    fn zero() -> Self;
    fn write_le(self, dst: &mut [u8]);
    fn read_le(src: &[u8]) -> Self;
    fn to_json(self) -> Value;
    fn from_json_number(json: &Value) -> Option<Self>;

    /// `0x`-prefixed upper-case hex text. `None` for floating point types.
    fn to_hex(self) -> Option<String>;
    fn from_hex(text: &str) -> Option<Self>;

    /// Add, wrapping for integers.
    fn step_up(self, by: Self) -> Self;
    /// Subtract, wrapping for integers.
    fn step_down(self, by: Self) -> Self;
}

/// Marker for integer primitives, which support hex JSON rendering.
pub trait IntegerPrimitive: NumericPrimitive {}

macro_rules! impl_integer {
    ($($ty:ty => $unsigned:ty, $name:literal, $from:ident);* $(;)?) => {$(
        impl NumericPrimitive for $ty {
            const TYPE_NAME: &'static str = $name;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn zero() -> Self {
                0
            }

            fn write_le(self, dst: &mut [u8]) {
                dst[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(src: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&src[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }

            fn to_json(self) -> Value {
                Value::from(self)
            }

            fn from_json_number(json: &Value) -> Option<Self> {
                json.$from().and_then(|n| <$ty>::try_from(n).ok())
            }

            fn to_hex(self) -> Option<String> {
                Some(format!("0x{:X}", self))
            }

            fn from_hex(text: &str) -> Option<Self> {
                let digits = text
                    .strip_prefix("0x")
                    .or_else(|| text.strip_prefix("0X"))?;
                <$unsigned>::from_str_radix(digits, 16)
                    .ok()
                    .map(|raw| raw as $ty)
            }

            fn step_up(self, by: Self) -> Self {
                self.wrapping_add(by)
            }

            fn step_down(self, by: Self) -> Self {
                self.wrapping_sub(by)
            }
        }

        impl IntegerPrimitive for $ty {}
    )*};
}

impl_integer! {
    u8 => u8, "Uint8", as_u64;
    u16 => u16, "Uint16", as_u64;
    u32 => u32, "Uint32", as_u64;
    u64 => u64, "Uint64", as_u64;
    i8 => u8, "Int8", as_i64;
    i16 => u16, "Int16", as_i64;
    i32 => u32, "Int32", as_i64;
    i64 => u64, "Int64", as_i64;
}

macro_rules! impl_float {
    ($($ty:ty, $name:literal);* $(;)?) => {$(
        impl NumericPrimitive for $ty {
            const TYPE_NAME: &'static str = $name;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn zero() -> Self {
                0.0
            }

            fn write_le(self, dst: &mut [u8]) {
                dst[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(src: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&src[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }

            fn to_json(self) -> Value {
                Value::from(self as f64)
            }

            fn from_json_number(json: &Value) -> Option<Self> {
                json.as_f64().map(|n| n as $ty)
            }

            fn to_hex(self) -> Option<String> {
                None
            }

            fn from_hex(_text: &str) -> Option<Self> {
                None
            }

            fn step_up(self, by: Self) -> Self {
                self + by
            }

            fn step_down(self, by: Self) -> Self {
                self - by
            }
        }
    )*};
}

impl_float! {
    f32, "Float";
    f64, "Double";
}

/// Codec for a single little-endian number.
///
/// ```
/// use dm_core::{Numeric, ValueCodec};
///
/// let codec = Numeric::<u16>::new();
/// let mut buf = [0u8; 2];
/// codec.encode(&0x1234, &mut buf);
/// assert_eq!(buf, [0x34, 0x12]);
/// ```
pub struct Numeric<T> {
    hex: bool,
    _value: PhantomData<fn() -> T>,
}

impl<T: NumericPrimitive> Numeric<T> {
    pub fn new() -> Self {
        Self {
            hex: false,
            _value: PhantomData,
        }
    }
}

impl<T: IntegerPrimitive> Numeric<T> {
    /// Render `val` as a hex string (`"0x1F"`) instead of a JSON number.
    pub fn hex() -> Self {
        Self {
            hex: true,
            _value: PhantomData,
        }
    }
}

impl<T: NumericPrimitive> Default for Numeric<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Numeric<T>
where
    T: NumericPrimitive,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Numeric")
            .field("type", &T::TYPE_NAME)
            .field("hex", &self.hex)
            .finish()
    }
}

impl<T: NumericPrimitive> ValueCodec for Numeric<T> {
    type Value = T;

    fn type_name(&self) -> &str {
        T::TYPE_NAME
    }

    fn size(&self) -> usize {
        T::SIZE
    }

    fn default_value(&self) -> T {
        T::zero()
    }

    fn encode(&self, value: &T, dst: &mut [u8]) {
        value.write_le(dst);
    }

    fn decode(&self, src: &[u8]) -> T {
        T::read_le(src)
    }

    fn to_json(&self, value: &T) -> Value {
        if self.hex {
            if let Some(text) = value.to_hex() {
                return Value::String(text);
            }
        }
        value.to_json()
    }

    fn from_json(&self, json: &Value) -> Result<T, String> {
        match json {
            Value::Number(_) => T::from_json_number(json)
                .ok_or_else(|| format!("{} is out of range for {}", json, T::TYPE_NAME)),
            Value::String(text) => T::from_hex(text)
                .ok_or_else(|| format!("'{}' is not a valid {} value", text, T::TYPE_NAME)),
            other => Err(format!("expected a number, got {}", other)),
        }
    }
}

// ============================================================================
// Boolean
// ============================================================================

/// Codec for a one-byte boolean.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bool;

impl ValueCodec for Bool {
    type Value = bool;

    fn type_name(&self) -> &str {
        "Bool"
    }

    fn size(&self) -> usize {
        1
    }

    fn default_value(&self) -> bool {
        false
    }

    fn encode(&self, value: &bool, dst: &mut [u8]) {
        dst[0] = u8::from(*value);
    }

    fn decode(&self, src: &[u8]) -> bool {
        src[0] != 0
    }

    fn to_json(&self, value: &bool) -> Value {
        Value::Bool(*value)
    }

    fn from_json(&self, json: &Value) -> Result<bool, String> {
        json.as_bool()
            .ok_or_else(|| format!("expected true or false, got {}", json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_numeric_layout_is_little_endian() {
        let codec = Numeric::<i32>::new();
        let bytes = encode_to_vec(&codec, &-2);
        assert_eq!(bytes, vec![0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(codec.decode(&bytes), -2);
        assert_eq!(ValueCodec::size(&codec), 4);
        assert_eq!(ValueCodec::type_name(&codec), "Int32");
    }

    #[test]
    fn test_numeric_json() {
        let codec = Numeric::<u32>::new();
        assert_eq!(codec.to_json(&1234), json!(1234));
        assert_eq!(codec.from_json(&json!(1234)), Ok(1234));
        assert!(codec.from_json(&json!("abc")).is_err());
        assert!(codec.from_json(&json!(-1)).is_err());
        assert!(codec.from_json(&json!(1.5)).is_err());
        assert!(codec.from_json(&json!(null)).is_err());
    }

    #[test]
    fn test_hex_rendering() {
        let codec = Numeric::<u16>::hex();
        assert_eq!(codec.to_json(&0x1F), json!("0x1F"));
        assert_eq!(codec.from_json(&json!("0x1f")), Ok(0x1F));
        assert_eq!(codec.from_json(&json!(31)), Ok(31));

        let signed = Numeric::<i8>::hex();
        assert_eq!(signed.to_json(&-1), json!("0xFF"));
        assert_eq!(signed.from_json(&json!("0xFF")), Ok(-1));
    }

    #[test]
    fn test_float_codec() {
        let codec = Numeric::<f64>::new();
        assert_eq!(codec.from_json(&json!(21.5)), Ok(21.5));
        assert_eq!(codec.from_json(&json!(3)), Ok(3.0));
        assert_eq!(codec.to_json(&21.5), json!(21.5));
        assert!(codec.from_json(&json!("0x10")).is_err());
        assert_eq!(codec.decode(&encode_to_vec(&codec, &-0.25)), -0.25);
    }

    #[test]
    fn test_wrapping_steps() {
        assert_eq!(u8::MAX.step_up(1), 0);
        assert_eq!(0u8.step_down(1), u8::MAX);
        assert_eq!(1.5f32.step_up(1.0), 2.5);
    }

    #[test]
    fn test_bool_codec() {
        let bytes = encode_to_vec(&Bool, &true);
        assert_eq!(bytes, vec![1]);
        assert!(Bool.decode(&bytes));
        assert_eq!(Bool.from_json(&json!(false)), Ok(false));
        assert!(Bool.from_json(&json!(0)).is_err());
    }

    #[test]
    fn test_erased_codec_round_trip() {
        let codec: Arc<dyn DynCodec> = Arc::new(Numeric::<u32>::new());
        assert_eq!(codec.default_bytes(), vec![0, 0, 0, 0]);
        let payload = codec.payload_from_json(&json!(7)).unwrap();
        assert_eq!(codec.payload_to_json(&payload), json!(7));

        let concrete = codec.into_any().downcast::<Numeric<u32>>();
        assert!(concrete.is_ok());
    }
}
