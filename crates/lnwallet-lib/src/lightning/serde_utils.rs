use serde::{de::Error, Deserialize, Deserializer, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

/// Parse a `0x` prefixed hex string into anything that can be built from a byte vector.
pub fn from_hex<'de, D, E>(deserializer: D) -> Result<E, D::Error>
where
    D: Deserializer<'de>,
    E: TryFrom<Vec<u8>>,
    E::Error: core::fmt::Debug,
{
    let string = String::deserialize(deserializer)?;
    let Some(stripped) = string.strip_prefix("0x") else {
        return Err(Error::custom(format!(
            "hex string does not start with 0x: {}",
            &string
        )));
    };
    let bytes = hex::decode(stripped)
        .map_err(|err| Error::custom(format!("failed to decode hex {}: {:?}", &string, err)))?;
    bytes
        .try_into()
        .map_err(|err| Error::custom(format!("unexpected byte length: {:?}", err)))
}

pub fn to_hex<E, S>(e: E, serializer: S) -> Result<S::Ok, S::Error>
where
    E: AsRef<[u8]>,
    S: Serializer,
{
    serializer.serialize_str(&format!("0x{}", &hex::encode(e.as_ref())))
}

/// `serde_with` adapter for fixed size byte arrays and byte vectors.
pub struct SliceHex;

impl<T> SerializeAs<T> for SliceHex
where
    T: AsRef<[u8]>,
{
    fn serialize_as<S>(source: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        to_hex(source, serializer)
    }
}

impl<'de, T> DeserializeAs<'de, T> for SliceHex
where
    T: TryFrom<Vec<u8>>,
    T::Error: core::fmt::Debug,
{
    fn deserialize_as<D>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
    {
        from_hex(deserializer)
    }
}
