//! Variable Context & Session Sensor Cache (spec.md §3). Cleared at the
//! start of each flow execution; owned exclusively by the executing flow.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    vars: HashMap<String, String>,
    last_extracted: Option<String>,
}

impl VariableContext {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    pub fn set_last_extracted(&mut self, value: impl Into<String>) {
        self.last_extracted = Some(value.into());
    }

    /// Substitutes `${var}`, `${sensor:id}`, and `${last_extracted}` in
    /// `template`. Unknown references are left as-is (spec.md is silent on
    /// this edge case; leaving them verbatim surfaces the mistake instead
    /// of silently erasing the placeholder).
    pub fn substitute(&self, template: &str, sensor_cache: &SessionSensorCache) -> String {
        let mut out = String::with_capacity(template.len());
        let bytes = template.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
                if let Some(end) = template[i + 2..].find('}') {
                    let key = &template[i + 2..i + 2 + end];
                    let replacement = if key == "last_extracted" {
                        self.last_extracted.clone()
                    } else if let Some(sensor_id) = key.strip_prefix("sensor:") {
                        sensor_cache.get(sensor_id).map(|s| s.to_string())
                    } else {
                        self.get(key).map(|s| s.to_string())
                    };
                    match replacement {
                        Some(v) => out.push_str(&v),
                        None => out.push_str(&template[i..i + 2 + end + 1]),
                    }
                    i += 2 + end + 1;
                    continue;
                }
            }
            let ch = template[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionSensorCache {
    values: HashMap<String, String>,
}

impl SessionSensorCache {
    pub fn get(&self, sensor_id: &str) -> Option<&str> {
        self.values.get(sensor_id).map(|s| s.as_str())
    }

    pub fn insert(&mut self, sensor_id: impl Into<String>, value: impl Into<String>) {
        self.values.insert(sensor_id.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_var_sensor_and_last_extracted() {
        let mut ctx = VariableContext::default();
        ctx.set("name", "alice");
        ctx.set_last_extracted("42");
        let mut cache = SessionSensorCache::default();
        cache.insert("battery", "87");

        let out = ctx.substitute("hi ${name}, battery=${sensor:battery}, last=${last_extracted}", &cache);
        assert_eq!(out, "hi alice, battery=87, last=42");
    }

    #[test]
    fn unknown_reference_left_verbatim() {
        let ctx = VariableContext::default();
        let cache = SessionSensorCache::default();
        let out = ctx.substitute("${mystery}", &cache);
        assert_eq!(out, "${mystery}");
    }
}
