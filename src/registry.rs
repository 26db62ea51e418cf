use std::collections::HashMap;

use bus_protocol::{DEFAULT_CODE_ORDER, RESERVED_PREFIX};

use crate::error::{BusError, BusResult};

/// Maps wire codes to the numeric codeid they were assigned at registration
/// time, and back. Reserved (`bus::`) codes are always registered first, in
/// `DEFAULT_CODE_ORDER`, so `welcome` is always codeid 0 and `ok` is always
/// codeid 1 regardless of what a caller registers afterwards.
#[derive(Debug)]
pub struct CodeRegistry {
    code_to_id: HashMap<String, u32>,
    codes: Vec<String>,
}

impl Default for CodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            code_to_id: HashMap::new(),
            codes: Vec::new(),
        };
        for code in DEFAULT_CODE_ORDER {
            reg.push(code);
        }
        reg
    }

    fn push(&mut self, code: &str) -> u32 {
        let id = u32::try_from(self.codes.len()).expect("codeid space exhausted");
        self.codes.push(code.to_string());
        self.code_to_id.insert(code.to_string(), id);
        id
    }

    /// Register a caller-supplied code, appending it after whatever is
    /// already registered.
    ///
    /// Re-registering a code that is already known is not an error -- the
    /// catalog favors live extensibility over strict uniqueness, so this is
    /// a no-op that keeps the code's existing codeid rather than moving it
    /// to the end. Only the reserved `bus::` namespace is rejected.
    pub fn register(&mut self, code: &str) -> BusResult<u32> {
        if code.starts_with(RESERVED_PREFIX) && !DEFAULT_CODE_ORDER.contains(&code) {
            return Err(BusError::ReservedCode(code.to_string()));
        }
        if let Some(&id) = self.code_to_id.get(code) {
            return Ok(id);
        }
        Ok(self.push(code))
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code_to_id.contains_key(code)
    }

    pub fn id_of(&self, code: &str) -> Option<u32> {
        self.code_to_id.get(code).copied()
    }

    pub fn code_of(&self, id: u32) -> Option<&str> {
        self.codes.get(id as usize).map(String::as_str)
    }

    /// All registered codes, in codeid order. This is exactly the list a
    /// `Welcome` message carries.
    pub fn codes_in_order(&self) -> &[String] {
        &self.codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_is_codeid_zero_and_ok_is_codeid_one() {
        let reg = CodeRegistry::new();
        assert_eq!(reg.id_of("bus::welcome"), Some(0));
        assert_eq!(reg.id_of("bus::ok"), Some(1));
    }

    #[test]
    fn caller_codes_append_after_reserved_ones() {
        let mut reg = CodeRegistry::new();
        let reserved_count = reg.codes_in_order().len();
        let id = reg.register("app::greeting").unwrap();
        assert_eq!(id as usize, reserved_count);
        assert_eq!(reg.code_of(id), Some("app::greeting"));
    }

    #[test]
    fn rejects_reserved_prefix_but_not_duplicates() {
        let mut reg = CodeRegistry::new();
        assert!(matches!(
            reg.register("bus::whatever"),
            Err(BusError::ReservedCode(_))
        ));
        let id = reg.register("app::x").unwrap();
        // Re-registering the same code is idempotent and keeps its codeid --
        // the catalog favors mutability over strict uniqueness.
        assert_eq!(reg.register("app::x").unwrap(), id);
    }
}
