//! The [`Coder`]: one key codec, one value codec, and per-type overrides.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EncodingError, EncodingResult};
use crate::key::KeyCodec;
use crate::value::ValueCodec;

/// A value type that serializes itself.
///
/// Registered with [`CoderBuilder::with_custom`], it is consulted instead of
/// the configured value codec, which it receives as a delegate. The override
/// sees the stored bytes as-is, including empty input.
pub trait CustomValue: Any + Send + Sync {
    fn encode_value(&self, codec: &ValueCodec) -> EncodingResult<Vec<u8>>;

    fn decode_value(&mut self, codec: &ValueCodec, data: &[u8]) -> EncodingResult<()>;
}

type EncodeFn = fn(&dyn Any, &ValueCodec) -> EncodingResult<Vec<u8>>;
type DecodeFn = fn(&mut dyn Any, &ValueCodec, &[u8]) -> EncodingResult<()>;

#[derive(Clone, Copy)]
struct Override {
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_custom<T: CustomValue>(value: &dyn Any, codec: &ValueCodec) -> EncodingResult<Vec<u8>> {
    value
        .downcast_ref::<T>()
        .ok_or(EncodingError::OverrideType {
            type_name: type_name::<T>(),
        })?
        .encode_value(codec)
}

fn decode_custom<T: CustomValue>(
    out: &mut dyn Any,
    codec: &ValueCodec,
    data: &[u8],
) -> EncodingResult<()> {
    out.downcast_mut::<T>()
        .ok_or(EncodingError::OverrideType {
            type_name: type_name::<T>(),
        })?
        .decode_value(codec, data)
}

/// Immutable key + value coder shared by a connection and its buckets.
#[derive(Clone)]
pub struct Coder {
    keys: KeyCodec,
    values: ValueCodec,
    overrides: Arc<HashMap<TypeId, Override>>,
}

impl Coder {
    /// A coder with no custom overrides.
    pub fn new(keys: KeyCodec, values: ValueCodec) -> Self {
        Self {
            keys,
            values,
            overrides: Arc::new(HashMap::new()),
        }
    }

    pub fn builder() -> CoderBuilder {
        CoderBuilder::default()
    }

    pub fn keys(&self) -> &KeyCodec {
        &self.keys
    }

    pub fn values(&self) -> &ValueCodec {
        &self.values
    }

    /// Whether `V` has a registered override.
    pub fn is_custom<V: Any>(&self) -> bool {
        self.overrides.contains_key(&TypeId::of::<V>())
    }

    /// Encode a value, through its override when one is registered.
    pub fn encode_value<V: Serialize + Any>(&self, value: &V) -> EncodingResult<Vec<u8>> {
        match self.overrides.get(&TypeId::of::<V>()) {
            Some(custom) => (custom.encode)(value, &self.values),
            None => self.values.encode(value),
        }
    }

    /// Decode `data` into `out`, through its override when one is registered.
    ///
    /// Without an override, empty `data` leaves `out` untouched.
    pub fn decode_into<V: DeserializeOwned + Any>(
        &self,
        data: &[u8],
        out: &mut V,
    ) -> EncodingResult<()> {
        match self.overrides.get(&TypeId::of::<V>()) {
            Some(custom) => (custom.decode)(out, &self.values, data),
            None => self.values.decode_into(data, out),
        }
    }

    /// Decode `data` into a fresh `V::default()`.
    pub fn decode<V: DeserializeOwned + Default + Any>(&self, data: &[u8]) -> EncodingResult<V> {
        let mut out = V::default();
        self.decode_into(data, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for Coder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut custom: Vec<&str> = self.overrides.values().map(|o| o.type_name).collect();
        custom.sort_unstable();
        f.debug_struct("Coder")
            .field("keys", &self.keys.name())
            .field("values", &self.values.name())
            .field("custom", &custom)
            .finish()
    }
}

/// Builder for [`Coder`]. Both codecs must be chosen before [`build`].
///
/// [`build`]: CoderBuilder::build
#[derive(Default)]
pub struct CoderBuilder {
    keys: Option<KeyCodec>,
    values: Option<ValueCodec>,
    overrides: HashMap<TypeId, Override>,
}

impl CoderBuilder {
    pub fn keys(mut self, keys: KeyCodec) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn values(mut self, values: ValueCodec) -> Self {
        self.values = Some(values);
        self
    }

    /// Route values of type `T` through its own [`CustomValue`] impl.
    pub fn with_custom<T: CustomValue>(mut self) -> Self {
        self.overrides.insert(
            TypeId::of::<T>(),
            Override {
                type_name: type_name::<T>(),
                encode: encode_custom::<T>,
                decode: decode_custom::<T>,
            },
        );
        self
    }

    pub fn build(self) -> EncodingResult<Coder> {
        let keys = self.keys.ok_or(EncodingError::MissingCoder("key"))?;
        let values = self.values.ok_or(EncodingError::MissingCoder("value"))?;
        Ok(Coder {
            keys,
            values,
            overrides: Arc::new(self.overrides),
        })
    }
}
