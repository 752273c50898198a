//! Accessors over `diskutil -plist` dictionaries.
//!
//! diskutil spells the same fact differently across macOS releases, so every
//! accessor takes the candidate keys in preference order.

use plist::{Dictionary, Value};

pub fn string(dict: &Dictionary, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = dict.get(*key).and_then(|v| v.as_string()) {
            return Some(value.to_string());
        }
    }
    None
}

pub fn unsigned(dict: &Dictionary, keys: &[&str]) -> Option<u64> {
    for key in keys {
        if let Some(value) = dict.get(*key) {
            if let Some(u) = value.as_unsigned_integer() {
                return Some(u);
            }
            if let Some(i) = value.as_signed_integer() {
                if i >= 0 {
                    return Some(i as u64);
                }
            }
        }
    }
    None
}

pub fn boolean(dict: &Dictionary, keys: &[&str]) -> Option<bool> {
    for key in keys {
        if let Some(value) = dict.get(*key).and_then(|v| v.as_boolean()) {
            return Some(value);
        }
    }
    None
}

pub fn string_array(dict: &Dictionary, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Some(arr) = dict.get(*key).and_then(|v| v.as_array()) {
            return arr
                .iter()
                .filter_map(|v| v.as_string())
                .map(|s| s.to_string())
                .collect();
        }
    }
    Vec::new()
}

pub fn array<'a>(dict: &'a Dictionary, keys: &[&str]) -> Vec<&'a Value> {
    for key in keys {
        if let Some(arr) = dict.get(*key).and_then(|v| v.as_array()) {
            return arr.iter().collect();
        }
    }
    Vec::new()
}
