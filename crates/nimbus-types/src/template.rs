// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named set of string key/value pairs, e.g. a `DISK` or `NIC` section of a
/// VM template. Keys are stored upper-case.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorAttribute {
    name: String,
    values: BTreeMap<String, String>,
}

impl VectorAttribute {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into().to_uppercase(), values: BTreeMap::new() }
    }

    /// Builds an attribute from `(key, value)` pairs.
    pub fn from_pairs<S, I, K, V>(name: S, pairs: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut attr = Self::new(name);
        for (k, v) in pairs {
            attr.replace(k.as_ref(), v);
        }
        attr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value of `key`, treating an empty string as absent.
    pub fn vector_value(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_uppercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn get<T: FromStr>(&self, key: &str) -> Option<T> {
        self.vector_value(key)?.trim().parse().ok()
    }

    /// True if `key` is set to `YES` (case-insensitive).
    pub fn is_yes(&self, key: &str) -> bool {
        self.vector_value(key).is_some_and(|v| v.eq_ignore_ascii_case("YES"))
    }

    pub fn replace<V: Into<String>>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_uppercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(&key.to_uppercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vector_value(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for VectorAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=[", self.name)?;
        for (i, (k, v)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}=\"{v}\"")?;
        }
        write!(f, "]")
    }
}
