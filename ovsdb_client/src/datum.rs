/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! OVSDB atoms and datums, and their JSON encoding.

use anyhow::Result;
use serde_json::{json, Value};
use uuid::Uuid;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::error;
use std::fmt;

use crate::schema::{AtomicType, ColumnType};

#[derive(Debug)]
pub struct DatumError(pub String);

impl fmt::Display for DatumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for DatumError {}

/// A single value of one of the OVSDB atomic types.
#[derive(Clone, Debug)]
pub enum Atom {
    Integer(i64),
    Real(f64),
    Boolean(bool),
    String(String),
    Uuid(Uuid),
}

impl Atom {
    pub fn atomic_type(&self) -> AtomicType {
        match self {
            Atom::Integer(_) => AtomicType::Integer,
            Atom::Real(_) => AtomicType::Real,
            Atom::Boolean(_) => AtomicType::Boolean,
            Atom::String(_) => AtomicType::String,
            Atom::Uuid(_) => AtomicType::Uuid,
        }
    }

    pub fn default_for(atomic: AtomicType) -> Atom {
        match atomic {
            AtomicType::Integer => Atom::Integer(0),
            AtomicType::Real => Atom::Real(0.0),
            AtomicType::Boolean => Atom::Boolean(false),
            AtomicType::String => Atom::String(String::new()),
            AtomicType::Uuid => Atom::Uuid(Uuid::nil()),
        }
    }

    pub fn from_json(atomic: AtomicType, json: &Value) -> Result<Atom> {
        let atom = match (atomic, json) {
            (AtomicType::Integer, Value::Number(n)) => n.as_i64().map(Atom::Integer),
            (AtomicType::Real, Value::Number(n)) => n.as_f64().map(Atom::Real),
            (AtomicType::Boolean, Value::Bool(b)) => Some(Atom::Boolean(*b)),
            (AtomicType::String, Value::String(s)) => Some(Atom::String(s.clone())),
            (AtomicType::Uuid, Value::Array(a)) if a.len() == 2 && a[0] == "uuid" => {
                a[1].as_str().and_then(|s| Uuid::parse_str(s).ok()).map(Atom::Uuid)
            },
            (AtomicType::Uuid, Value::Array(a)) if a.len() == 2 && a[0] == "named-uuid" => {
                Err(DatumError(format!("named-uuid {} not allowed here", a[1])))?
            },
            _ => None,
        };
        match atom {
            Some(atom) => Ok(atom),
            None => Err(DatumError(format!("expected {}, got {}", atomic, json)))?
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Atom::Integer(i) => json!(i),
            Atom::Real(r) => json!(r),
            Atom::Boolean(b) => json!(b),
            Atom::String(s) => json!(s),
            Atom::Uuid(u) => json!(["uuid", u.to_string()]),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Atom::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Atom::Real(r) => Some(*r),
            Atom::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Atom::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<&Uuid> {
        match self {
            Atom::Uuid(u) => Some(u),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Atom::Integer(_) => 0,
            Atom::Real(_) => 1,
            Atom::Boolean(_) => 2,
            Atom::String(_) => 3,
            Atom::Uuid(_) => 4,
        }
    }
}

impl Ord for Atom {
    fn cmp(&self, other: &Atom) -> Ordering {
        match (self, other) {
            (Atom::Integer(a), Atom::Integer(b)) => a.cmp(b),
            (Atom::Real(a), Atom::Real(b)) => a.total_cmp(b),
            (Atom::Boolean(a), Atom::Boolean(b)) => a.cmp(b),
            (Atom::String(a), Atom::String(b)) => a.cmp(b),
            (Atom::Uuid(a), Atom::Uuid(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Atom) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Atom) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Atom {}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Atom::Integer(i) => write!(f, "{}", i),
            Atom::Real(r) => write!(f, "{}", r),
            Atom::Boolean(b) => write!(f, "{}", b),
            Atom::String(s) => write!(f, "{:?}", s),
            Atom::Uuid(u) => write!(f, "{}", u),
        }
    }
}

impl From<i64> for Atom {
    fn from(i: i64) -> Atom { Atom::Integer(i) }
}

impl From<bool> for Atom {
    fn from(b: bool) -> Atom { Atom::Boolean(b) }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Atom { Atom::String(s.into()) }
}

impl From<String> for Atom {
    fn from(s: String) -> Atom { Atom::String(s) }
}

impl From<Uuid> for Atom {
    fn from(u: Uuid) -> Atom { Atom::Uuid(u) }
}

/// The value of a column: a set of atoms or a map from atoms to atoms.
///
/// Scalars are sets with one element.  Keys are kept sorted and unique.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Datum {
    Set(BTreeSet<Atom>),
    Map(BTreeMap<Atom, Atom>),
}

impl Datum {
    pub fn empty_set() -> Datum {
        Datum::Set(BTreeSet::new())
    }

    pub fn empty_map() -> Datum {
        Datum::Map(BTreeMap::new())
    }

    pub fn scalar<A: Into<Atom>>(atom: A) -> Datum {
        Datum::Set(std::iter::once(atom.into()).collect())
    }

    /// A set that holds `atom` if it is present and is empty otherwise.
    pub fn optional<A: Into<Atom>>(atom: Option<A>) -> Datum {
        Datum::Set(atom.into_iter().map(Into::into).collect())
    }

    pub fn set<A: Into<Atom>, I: IntoIterator<Item = A>>(atoms: I) -> Datum {
        Datum::Set(atoms.into_iter().map(Into::into).collect())
    }

    pub fn map<K, V, I>(pairs: I) -> Datum
    where K: Into<Atom>, V: Into<Atom>, I: IntoIterator<Item = (K, V)>
    {
        Datum::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Datum::Set(s) => s.len(),
            Datum::Map(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_default(&self, type_: &ColumnType) -> bool {
        *self == type_.default_datum()
    }

    pub fn keys(&self) -> Box<dyn Iterator<Item = &Atom> + '_> {
        match self {
            Datum::Set(s) => Box::new(s.iter()),
            Datum::Map(m) => Box::new(m.keys()),
        }
    }

    pub fn values(&self) -> Box<dyn Iterator<Item = &Atom> + '_> {
        match self {
            Datum::Set(_) => Box::new(std::iter::empty()),
            Datum::Map(m) => Box::new(m.values()),
        }
    }

    pub fn contains_key(&self, key: &Atom) -> bool {
        match self {
            Datum::Set(s) => s.contains(key),
            Datum::Map(m) => m.contains_key(key),
        }
    }

    pub fn get(&self, key: &Atom) -> Option<&Atom> {
        match self {
            Datum::Set(_) => None,
            Datum::Map(m) => m.get(key),
        }
    }

    /// The single element of a scalar or optional scalar, if there is one.
    pub fn first(&self) -> Option<&Atom> {
        self.keys().next()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.first().and_then(Atom::as_str)
    }

    pub fn as_integer(&self) -> Option<i64> {
        self.first().and_then(Atom::as_integer)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.first().and_then(Atom::as_bool)
    }

    pub fn as_uuid(&self) -> Option<&Uuid> {
        self.first().and_then(Atom::as_uuid)
    }

    pub fn strings(&self) -> Vec<String> {
        self.keys().filter_map(Atom::as_str).map(String::from).collect()
    }

    pub fn integers(&self) -> Vec<i64> {
        self.keys().filter_map(Atom::as_integer).collect()
    }

    pub fn uuids(&self) -> Vec<Uuid> {
        self.keys().filter_map(Atom::as_uuid).cloned().collect()
    }

    /// A string-to-string map as an ordinary map.  Other kinds of pairs are skipped.
    pub fn string_map(&self) -> BTreeMap<String, String> {
        match self {
            Datum::Set(_) => BTreeMap::new(),
            Datum::Map(m) => m.iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                .collect()
        }
    }

    /// Looks up string `key` in a map and returns its string value.
    pub fn map_str(&self, key: &str) -> Option<&str> {
        self.get(&Atom::from(key)).and_then(Atom::as_str)
    }

    /// Returns true if every element of `other` is also in `self` (with the same value, for
    /// maps).
    pub fn includes(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::Set(a), Datum::Set(b)) => b.is_subset(a),
            (Datum::Map(a), Datum::Map(b)) => b.iter().all(|(k, v)| a.get(k) == Some(v)),
            (Datum::Map(a), Datum::Set(b)) => b.iter().all(|k| a.contains_key(k)),
            (Datum::Set(_), Datum::Map(b)) => b.is_empty(),
        }
    }

    /// Returns true if no element of `other` is in `self`.
    pub fn excludes(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::Set(a), Datum::Set(b)) => a.is_disjoint(b),
            (Datum::Map(a), Datum::Map(b)) => b.iter().all(|(k, v)| a.get(k) != Some(v)),
            (Datum::Map(a), Datum::Set(b)) => b.iter().all(|k| !a.contains_key(k)),
            (Datum::Set(_), Datum::Map(_)) => true,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Datum::Set(s) if s.len() == 1 => s.iter().next().map(Atom::to_json).unwrap_or(Value::Null),
            Datum::Set(s) => json!(["set", s.iter().map(Atom::to_json).collect::<Vec<_>>()]),
            Datum::Map(m) => json!(["map", m.iter().map(|(k, v)| json!([k.to_json(), v.to_json()]))
                                    .collect::<Vec<_>>()]),
        }
    }

    /// Parses `json` as a datum of type `type_`, including the check that the number of
    /// elements is within the type's bounds.
    pub fn from_json(type_: &ColumnType, json: &Value) -> Result<Datum> {
        let datum = Datum::from_json_transient(type_, json)?;
        datum.check_size(type_)?;
        Ok(datum)
    }

    /// Parses `json` as a datum of type `type_` without checking the number of elements, as is
    /// needed for the diffs in `update2` notifications.
    pub fn from_json_transient(type_: &ColumnType, json: &Value) -> Result<Datum> {
        let tagged = match json {
            Value::Array(a) if a.len() == 2 && (a[0] == "set" || a[0] == "map") => {
                match &a[1] {
                    Value::Array(elems) => Some((a[0].as_str().unwrap_or(""), elems)),
                    _ => Err(DatumError(format!("bad {} syntax {}", a[0], json)))?
                }
            },
            _ => None,
        };
        match (&type_.value, tagged) {
            (Some(value_type), Some(("map", pairs))) => {
                let mut map = BTreeMap::new();
                for pair in pairs {
                    match pair.as_array().map(Vec::as_slice) {
                        Some([k, v]) => {
                            let k = Atom::from_json(type_.key.atomic, k)?;
                            let v = Atom::from_json(value_type.atomic, v)?;
                            if map.insert(k, v).is_some() {
                                Err(DatumError(format!("map {} contains duplicate key", json)))?
                            }
                        },
                        _ => Err(DatumError(format!("bad map pair {}", pair)))?
                    }
                }
                Ok(Datum::Map(map))
            },
            // An empty map may also be written as an empty set.
            (Some(_), Some(("set", elems))) if elems.is_empty() => Ok(Datum::empty_map()),
            (Some(_), _) => Err(DatumError(format!("expected map, got {}", json)))?,
            (None, Some(("set", elems))) => {
                let mut set = BTreeSet::new();
                for elem in elems {
                    if !set.insert(Atom::from_json(type_.key.atomic, elem)?) {
                        Err(DatumError(format!("set {} contains duplicate value", json)))?
                    }
                }
                Ok(Datum::Set(set))
            },
            (None, Some(_)) => Err(DatumError(format!("expected set, got {}", json)))?,
            (None, None) => Ok(Datum::scalar(Atom::from_json(type_.key.atomic, json)?)),
        }
    }

    pub fn check_size(&self, type_: &ColumnType) -> Result<()> {
        let n = self.len();
        if n < type_.min || type_.max.map_or(false, |max| n > max) {
            Err(DatumError(format!("datum has {} elements but type allows {} to {}", n, type_.min,
                                   type_.max.map_or("unlimited".to_string(), |max| max.to_string()))))?
        }
        Ok(())
    }

    /// Checks that `self` is a valid value for `type_`.
    pub fn check_type(&self, type_: &ColumnType) -> Result<()> {
        let ok = match (self, &type_.value) {
            (Datum::Set(s), None) => s.iter().all(|a| a.atomic_type() == type_.key.atomic),
            (Datum::Map(m), Some(value)) => m.iter().all(|(k, v)| {
                k.atomic_type() == type_.key.atomic && v.atomic_type() == value.atomic
            }),
            _ => false,
        };
        if !ok {
            Err(DatumError(format!("{} is not a valid {}", self, type_.to_json())))?
        }
        self.check_size(type_)
    }

    /// Computes the diff that turns `old` into `new`, in the form used by `update2`
    /// notifications.
    pub fn diff(old: &Datum, new: &Datum, type_: &ColumnType) -> Datum {
        if type_.is_scalar() {
            return new.clone();
        }
        match (old, new) {
            (Datum::Set(a), Datum::Set(b)) => Datum::Set(a.symmetric_difference(b).cloned().collect()),
            (Datum::Map(a), Datum::Map(b)) => {
                let mut diff = BTreeMap::new();
                for (k, v) in a {
                    match b.get(k) {
                        None => { diff.insert(k.clone(), v.clone()); },
                        Some(nv) if nv != v => { diff.insert(k.clone(), nv.clone()); },
                        Some(_) => (),
                    }
                }
                for (k, v) in b {
                    if !a.contains_key(k) {
                        diff.insert(k.clone(), v.clone());
                    }
                }
                Datum::Map(diff)
            },
            _ => new.clone(),
        }
    }

    /// Applies `diff` (see [`Datum::diff`]) to `self`.
    pub fn apply_diff(&self, diff: &Datum, type_: &ColumnType) -> Result<Datum> {
        let new = if type_.is_scalar() {
            diff.clone()
        } else {
            match (self, diff) {
                (Datum::Set(a), Datum::Set(d)) => Datum::Set(a.symmetric_difference(d).cloned().collect()),
                (Datum::Map(a), Datum::Map(d)) => {
                    let mut new = a.clone();
                    for (k, v) in d {
                        match a.get(k) {
                            Some(old) if old == v => { new.remove(k); },
                            _ => { new.insert(k.clone(), v.clone()); },
                        }
                    }
                    Datum::Map(new)
                },
                _ => Err(DatumError(format!("diff {} does not apply to {}", diff, self)))?
            }
        };
        if new.check_size(type_).is_err() {
            Err(DatumError("datum created by diff has size error".into()))?
        }
        Ok(new)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AtomicType, ColumnType};

    #[test]
    fn datum_json() -> Result<()> {
        let set = ColumnType::set(AtomicType::String);
        let datum = Datum::from_json(&set, &json!(["set", ["b", "a"]]))?;
        assert_eq!(datum, Datum::set(vec!["a", "b"]));
        assert_eq!(datum.to_json(), json!(["set", ["a", "b"]]));
        assert_eq!(Datum::from_json(&set, &json!("a"))?.to_json(), json!("a"));
        assert!(Datum::from_json(&set, &json!(["set", ["a", "a"]])).is_err());

        let map = ColumnType::map(AtomicType::String, AtomicType::Integer);
        let datum = Datum::from_json(&map, &json!(["map", [["x", 1], ["y", 2]]]))?;
        assert_eq!(datum.get(&"y".into()), Some(&Atom::Integer(2)));
        assert_eq!(Datum::from_json(&map, &json!(["set", []]))?, Datum::empty_map());
        assert!(Datum::from_json(&map, &json!("x")).is_err());

        let uuid = Uuid::new_v4();
        let scalar = ColumnType::scalar(AtomicType::Uuid);
        let datum = Datum::from_json(&scalar, &json!(["uuid", uuid.to_string()]))?;
        assert_eq!(datum.as_uuid(), Some(&uuid));
        assert!(Datum::from_json(&scalar, &json!(["set", []])).is_err());
        assert!(Datum::from_json(&scalar, &json!(["named-uuid", "row1"])).is_err());
        Ok(())
    }

    #[test]
    fn update2_diffs() -> Result<()> {
        let map = ColumnType::map(AtomicType::String, AtomicType::String);
        let old = Datum::map(vec![("a", "1"), ("b", "2"), ("c", "3")]);
        let new = Datum::map(vec![("a", "1"), ("b", "20"), ("d", "4")]);
        let diff = Datum::diff(&old, &new, &map);
        assert_eq!(diff, Datum::map(vec![("b", "20"), ("c", "3"), ("d", "4")]));
        assert_eq!(old.apply_diff(&diff, &map)?, new);

        let set = ColumnType::set(AtomicType::Integer);
        let old = Datum::set(vec![1i64, 2, 3]);
        let diff = Datum::set(vec![3i64, 4]);
        assert_eq!(old.apply_diff(&diff, &set)?, Datum::set(vec![1i64, 2, 4]));

        let optional = ColumnType::optional(AtomicType::Integer);
        assert!(Datum::scalar(1i64).apply_diff(&Datum::scalar(2i64), &optional).is_err());
        assert_eq!(Datum::scalar(1i64).apply_diff(&Datum::scalar(1i64), &optional)?,
                   Datum::empty_set());
        Ok(())
    }

    #[test]
    fn includes_and_excludes() {
        let a = Datum::set(vec!["x", "y"]);
        assert!(a.includes(&Datum::scalar("x")));
        assert!(!a.includes(&Datum::scalar("z")));
        assert!(a.excludes(&Datum::scalar("z")));
        let m = Datum::map(vec![("k", "v")]);
        assert!(m.includes(&Datum::map(vec![("k", "v")])));
        assert!(m.excludes(&Datum::map(vec![("k", "w")])));
    }
}
