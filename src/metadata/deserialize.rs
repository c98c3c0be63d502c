//! serde bridge: materialize typed descriptor structs straight from the
//! parsed config tree, so the descriptors below can just derive
//! `Deserialize`.

use core::marker::PhantomData;
use std::collections::BTreeMap;

use serde::de::value::StrDeserializer;
use serde::{de, forward_to_deserialize_any, Deserialize, Deserializer};

use crate::config::Value;
use crate::uuid::Uuid;

type DeError = serde::de::value::Error;

impl<'de> de::Deserializer<'de> for &'de Value {
    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }

    type Error = DeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self {
            Value::Int(n) => visitor.visit_i64(*n),
            Value::Str(s) => visitor.visit_str(s),
            Value::Array(xs) => visitor.visit_seq(ValuesAccess(xs.iter())),
            Value::Struct(fields) => visitor.visit_map(FieldsAccess(fields.iter().peekable())),
        }
    }

    // a present key is always Some; absent keys never reach us
    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_some(self)
    }
}

struct FieldsAccess<'de>(core::iter::Peekable<core::slice::Iter<'de, (String, Value)>>);

impl<'de> de::MapAccess<'de> for FieldsAccess<'de> {
    type Error = DeError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: de::DeserializeSeed<'de>,
    {
        match self.0.peek() {
            None => Ok(None),
            Some((k, _)) => seed.deserialize(StrDeserializer::new(k)).map(Some),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: de::DeserializeSeed<'de>,
    {
        match self.0.next() {
            None => panic!("deserializing value before key"),
            Some((_, v)) => seed.deserialize(v),
        }
    }
}

struct ValuesAccess<'de>(core::slice::Iter<'de, Value>);

impl<'de> de::SeqAccess<'de> for ValuesAccess<'de> {
    type Error = DeError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: de::DeserializeSeed<'de>,
    {
        match self.0.next() {
            None => Ok(None),
            Some(x) => seed.deserialize(x).map(Some),
        }
    }
}

/// A map that keeps whatever values decode and drops the rest. This is
/// how the `segmentN` groups are collected out of an LV block without
/// tripping over its scalar keys.
#[derive(Clone, Debug)]
pub struct TolerantMap<K, V>(pub BTreeMap<K, V>);

impl<'de, K: Deserialize<'de> + Ord, V: Deserialize<'de>> Deserialize<'de> for TolerantMap<K, V> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MapVisitor<K, V>(PhantomData<(K, V)>);
        impl<'de, K: Deserialize<'de> + Ord, V: Deserialize<'de>> de::Visitor<'de> for MapVisitor<K, V> {
            type Value = TolerantMap<K, V>;

            fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut m = BTreeMap::new();
                while let Some(k) = map.next_key()? {
                    if let Ok(v) = map.next_value() {
                        m.insert(k, v);
                    }
                }
                Ok(TolerantMap(m))
            }
        }
        deserializer.deserialize_map(MapVisitor(PhantomData))
    }
}

/// A strict map that preserves document order, which the VG model needs
/// for its `pvs` list.
#[derive(Clone, Debug)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MapVisitor<V>(PhantomData<V>);
        impl<'de, V: Deserialize<'de>> de::Visitor<'de> for MapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut m = Vec::new();
                while let Some(k) = map.next_key::<String>()? {
                    m.push((k, map.next_value()?));
                }
                Ok(OrderedMap(m))
            }
        }
        deserializer.deserialize_map(MapVisitor(PhantomData))
    }
}

/// The flat `stripes = ["pv0", 0, "pv1", 7]` array, read pairwise.
#[derive(Clone, Debug)]
pub struct StripeList(pub Vec<(String, u64)>);

impl<'de> Deserialize<'de> for StripeList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SeqVisitor;
        impl<'de> de::Visitor<'de> for SeqVisitor {
            type Value = StripeList;

            fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
                formatter.write_str("a flat array of (pv, offset) pairs")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut out = Vec::new();
                while let Some(pv) = seq.next_element::<String>()? {
                    let off = seq
                        .next_element::<u64>()?
                        .ok_or_else(|| de::Error::custom("stripes array has an odd length"))?;
                    out.push((pv, off));
                }
                Ok(StripeList(out))
            }
        }
        deserializer.deserialize_seq(SeqVisitor)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub(crate) struct VgDesc {
    pub id: Uuid,
    pub seqno: u32,
    pub status: Vec<String>,
    pub extent_size: u64,
    #[serde(default)]
    pub max_lv: u32,
    #[serde(default)]
    pub max_pv: u32,
    pub physical_volumes: OrderedMap<PvDesc>,
    #[serde(default)]
    pub logical_volumes: OrderedMap<LvDesc>,
}

#[derive(Deserialize, Clone, Debug)]
pub(crate) struct PvDesc {
    pub id: Uuid,
    pub device: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub status: Vec<String>,
    pub pe_start: u64,
    pub pe_count: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub(crate) struct LvDesc {
    pub id: Uuid,
    pub status: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub creation_host: String,
    pub creation_time: i64,
    pub segment_count: usize,
    #[serde(flatten)]
    pub segments: TolerantMap<String, SegmentDesc>,
}

#[derive(Deserialize, Clone, Debug)]
pub(crate) struct SegmentDesc {
    pub start_extent: u64,
    pub extent_count: u64,
    pub r#type: String,
    pub stripe_count: Option<u64>,
    pub stripe_size: Option<u64>,
    pub stripes: Option<StripeList>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn vg_desc_from_text() {
        let text = r#"
vg0 {
    id = "abcdef-ghij-klmn-opqr-stuv-wxyz-012345"
    seqno = 4
    status = ["RESIZEABLE", "READ", "WRITE"]
    extent_size = 8192
    max_lv = 0
    max_pv = 0
    physical_volumes {
        pv1 { id = "abcdef-ghij-klmn-opqr-stuv-wxyz-012345" device = "/dev/b" pe_start = 16384 pe_count = 14 }
        pv0 { id = "abcdef-ghij-klmn-opqr-stuv-wxyz-012346" device = "/dev/a" pe_start = 16384 pe_count = 14 }
    }
    logical_volumes {
        v1 {
            id = "abcdef-ghij-klmn-opqr-stuv-wxyz-012347"
            status = ["READ", "WRITE", "VISIBLE"]
            creation_host = "host"
            creation_time = 7
            segment_count = 1
            segment1 {
                start_extent = 0
                extent_count = 2
                type = "striped"
                stripe_count = 1
                stripes = ["pv0", 0]
            }
        }
    }
}
"#;
        let tree = config::parse_text(text).unwrap();
        let vg = tree.lookup("vg0").unwrap();
        let desc = VgDesc::deserialize(vg).unwrap();
        assert_eq!(desc.seqno, 4);
        // document order survives, not lexical order
        assert_eq!(desc.physical_volumes.0[0].0, "pv1");
        assert_eq!(desc.physical_volumes.0[1].0, "pv0");
        let (_, lv) = &desc.logical_volumes.0[0];
        assert_eq!(lv.segment_count, 1);
        let seg = &lv.segments.0["segment1"];
        assert_eq!(seg.extent_count, 2);
        assert_eq!(seg.stripe_count, Some(1));
        assert_eq!(seg.stripes.as_ref().unwrap().0, vec![("pv0".to_owned(), 0)]);
    }
}
