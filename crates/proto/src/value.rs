//! Dynamic value representation.
//!
//! Encodes primitive scalars, byte strings, ordered sequences, mappings
//! with string keys, N-dimensional arrays (dtype + shape + raw bytes), and
//! proxy references (§4.1 of the design). Round-trips through capnp's
//! packed wire format.

use crate::message_capnp::value as value_capnp;
use anyhow::Result;
use capnp::message::{Builder, ReaderOptions};
use capnp::serialize_packed;
use std::io::Cursor;

/// A remote object reference as it appears on the wire. The owning process
/// resolves this into a live object; every other process keeps it opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRef {
    pub address: String,
    pub obj_id: u64,
    pub type_name: String,
    pub attributes: Vec<String>,
}

/// A contiguous N-dimensional array: dtype tag, per-axis shape, raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NDArray {
    pub dtype: String,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

/// Any value that can cross an RPC boundary or be carried as an `opts`
/// field, a call argument, or a return value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
    NDArray(NDArray),
    Proxy(ProxyRef),
}

impl Value {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut message = Builder::new_default();
        {
            let mut root = message.init_root::<value_capnp::Builder>();
            write_value(self, &mut root);
        }
        let mut buf = Vec::new();
        serialize_packed::write_message(&mut buf, &message)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Value> {
        let mut cursor = Cursor::new(bytes);
        let reader = serialize_packed::read_message(&mut cursor, ReaderOptions::new())?;
        let root = reader.get_root::<value_capnp::Reader>()?;
        read_value(root)
    }
}

fn write_value(value: &Value, builder: &mut value_capnp::Builder) {
    match value {
        Value::Null => builder.set_null(()),
        Value::Bool(b) => builder.set_boolean(*b),
        Value::Int(i) => builder.set_int64(*i),
        Value::Float(f) => builder.set_float64(*f),
        Value::Text(s) => builder.set_text(s.as_str().into()),
        Value::Bytes(b) => builder.set_bytes(b.as_slice()),
        Value::List(items) => {
            let mut list = builder.reborrow().init_list(items.len() as u32);
            for (i, item) in items.iter().enumerate() {
                let mut entry = list.reborrow().get(i as u32);
                write_value(item, &mut entry);
            }
        }
        Value::Map(entries) => {
            let mut list = builder.reborrow().init_map(entries.len() as u32);
            for (i, (key, val)) in entries.iter().enumerate() {
                let mut entry = list.reborrow().get(i as u32);
                entry.set_key(key.as_str().into());
                let mut v = entry.init_value();
                write_value(val, &mut v);
            }
        }
        Value::NDArray(arr) => {
            let mut nd = builder.reborrow().init_ndarray();
            nd.set_dtype(arr.dtype.as_str().into());
            nd.set_data(arr.data.as_slice());
            let mut shape = nd.init_shape(arr.shape.len() as u32);
            for (i, dim) in arr.shape.iter().enumerate() {
                shape.set(i as u32, *dim);
            }
        }
        Value::Proxy(p) => {
            let mut proxy = builder.reborrow().init_proxy();
            proxy.set_address(p.address.as_str().into());
            proxy.set_obj_id(p.obj_id);
            proxy.set_type_name(p.type_name.as_str().into());
            let mut attrs = proxy.init_attributes(p.attributes.len() as u32);
            for (i, a) in p.attributes.iter().enumerate() {
                attrs.set(i as u32, a.as_str().into());
            }
        }
    }
}

fn read_value(reader: value_capnp::Reader) -> Result<Value> {
    use value_capnp::Which;
    Ok(match reader.which()? {
        Which::Null(()) => Value::Null,
        Which::Boolean(b) => Value::Bool(b),
        Which::Int64(i) => Value::Int(i),
        Which::Float64(f) => Value::Float(f),
        Which::Text(t) => Value::Text(t?.to_string()?),
        Which::Bytes(b) => Value::Bytes(b?.to_vec()),
        Which::List(list) => {
            let list = list?;
            let mut out = Vec::with_capacity(list.len() as usize);
            for item in list.iter() {
                out.push(read_value(item)?);
            }
            Value::List(out)
        }
        Which::Map(entries) => {
            let entries = entries?;
            let mut out = Vec::with_capacity(entries.len() as usize);
            for entry in entries.iter() {
                let key = entry.get_key()?.to_string()?;
                let val = read_value(entry.get_value()?)?;
                out.push((key, val));
            }
            Value::Map(out)
        }
        Which::Ndarray(nd) => {
            let nd = nd?;
            let shape = nd.get_shape()?.iter().collect();
            Value::NDArray(NDArray {
                dtype: nd.get_dtype()?.to_string()?,
                shape,
                data: nd.get_data()?.to_vec(),
            })
        }
        Which::Proxy(p) => {
            let p = p?;
            let mut attributes = Vec::new();
            for a in p.get_attributes()?.iter() {
                attributes.push(a?.to_string()?);
            }
            Value::Proxy(ProxyRef {
                address: p.get_address()?.to_string()?,
                obj_id: p.get_obj_id(),
                type_name: p.get_type_name()?.to_string()?,
                attributes,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars_and_collections() {
        let v = Value::Map(vec![
            ("a".into(), Value::Int(42)),
            ("b".into(), Value::List(vec![Value::Bool(true), Value::Null])),
            ("c".into(), Value::Text("hello".into())),
        ]);
        let encoded = v.encode().unwrap();
        let decoded = Value::decode(&encoded).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn round_trips_ndarray() {
        let v = Value::NDArray(NDArray {
            dtype: "float32".into(),
            shape: vec![2, 3],
            data: vec![0u8; 24],
        });
        let decoded = Value::decode(&v.encode().unwrap()).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn round_trips_proxy() {
        let v = Value::Proxy(ProxyRef {
            address: "tcp://127.0.0.1:5000".into(),
            obj_id: 7,
            type_name: "NodeGroup".into(),
            attributes: vec!["nodes".into(), "0".into()],
        });
        let decoded = Value::decode(&v.encode().unwrap()).unwrap();
        assert_eq!(v, decoded);
    }
}
