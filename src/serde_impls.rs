use crate::IntMap;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Error, Serialize, SerializeMap, Serializer};
use std::fmt;
use std::marker::PhantomData;

impl<V> Serialize for IntMap<V>
where
    V: Serialize + Send + Sync,
{
    /// Serializes the map as a map of `(key, value)` entries.
    ///
    /// The scan is raw: it fails if a resize is in flight, or if the entry
    /// count observed by the scan no longer matches the map's size.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let guard = self.guard();
        let expected = self.len();
        let mut map = serializer.serialize_map(Some(expected))?;
        let mut entries: Result<(), S::Error> = Ok(());
        let mut written = 0usize;
        self.for_each(
            |key, value| {
                if entries.is_ok() {
                    written += 1;
                    entries = map.serialize_entry(&key, value);
                }
            },
            &guard,
        )
        .map_err(S::Error::custom)?;
        entries?;
        if written != expected {
            return Err(S::Error::custom("map changed while serializing"));
        }
        map.end()
    }
}

impl<'de, V> Deserialize<'de> for IntMap<V>
where
    V: Deserialize<'de> + Send + Sync,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(IntMapVisitor {
            marker: PhantomData,
        })
    }
}

struct IntMapVisitor<V> {
    marker: PhantomData<V>,
}

impl<'de, V> Visitor<'de> for IntMapVisitor<V>
where
    V: Deserialize<'de> + Send + Sync,
{
    type Value = IntMap<V>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a map keyed by 32-bit integers")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let map = IntMap::with_capacity(access.size_hint().unwrap_or(0));
        {
            let guard = map.guard();
            while let Some((key, value)) = access.next_entry()? {
                map.insert(key, value, &guard);
            }
        }
        Ok(map)
    }
}
