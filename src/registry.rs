// File: src/registry.rs
//
// Function and class registries.
//
// The distilled spec's §9 Open Question notes the original source kept both
// a `FunctionRegistry` and a legacy `userDefinedFunctions` map and searched
// both during `Call`. This crate consolidates on the single
// `FunctionRegistry` below — there is no shadow map.

use std::collections::HashMap;

use crate::value::{ClassDescriptor, Value};

#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: String,
    pub parameters: Vec<String>,
    pub optional_parameters: Vec<String>,
    pub default_values: HashMap<String, Value>,
    pub start_address: usize,
    pub end_address: usize,
    pub is_lambda: bool,
    /// True if the registered signature sets a `throws` flag, or the
    /// declared return type is itself marked fallible (spec §4.2
    /// "Function-fallibility inference").
    pub is_fallible: bool,
}

impl FunctionSignature {
    pub fn required_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn max_count(&self) -> usize {
        self.parameters.len() + self.optional_parameters.len()
    }
}

#[derive(Debug, Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionSignature>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry { functions: HashMap::new() }
    }

    /// Registers `sig`. Re-registering an already-registered lambda is a
    /// no-op so the pre-pass's addresses (which let forward references
    /// resolve) are never clobbered by a later top-level re-encounter of the
    /// same `BeginFunction`.
    pub fn register(&mut self, sig: FunctionSignature) {
        if sig.is_lambda {
            if self.functions.contains_key(&sig.name) {
                return;
            }
        }
        self.functions.insert(sig.name.clone(), sig);
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSignature> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassDescriptor>,
    /// `ClassName::methodName` -> qualified function name in the
    /// `FunctionRegistry`, recorded while inside a `BeginClass`/`EndClass`
    /// range.
    pub field_offsets: HashMap<String, usize>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry { classes: HashMap::new(), field_offsets: HashMap::new() }
    }

    pub fn begin_class(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.classes.entry(name.clone()).or_insert_with(|| ClassDescriptor {
            name,
            fields: Vec::new(),
            methods: Vec::new(),
            super_class: None,
        });
    }

    pub fn define_field(&mut self, class_name: &str, field_name: impl Into<String>, default: Value) {
        if let Some(class) = self.classes.get_mut(class_name) {
            let field_name = field_name.into();
            let offset_key = format!("{class_name}::{field_name}");
            let offset = class.fields.len();
            self.field_offsets.insert(offset_key, offset);
            class.fields.push((field_name, default));
        }
    }

    pub fn register_method(&mut self, class_name: &str, method_name: impl Into<String>) {
        if let Some(class) = self.classes.get_mut(class_name) {
            class.methods.push(method_name.into());
        }
    }

    pub fn set_superclass(&mut self, class_name: &str, super_name: impl Into<String>) {
        if let Some(class) = self.classes.get_mut(class_name) {
            class.super_class = Some(super_name.into());
        }
    }

    pub fn get(&self, name: &str) -> Option<&ClassDescriptor> {
        self.classes.get(name)
    }

    /// Resolves `method:name` starting at `class_name`, walking the
    /// superclass chain. Qualified lookups go through the function registry
    /// by the caller using the returned owning class name.
    pub fn resolve_method(&self, class_name: &str, method_name: &str) -> Option<String> {
        let mut current = Some(class_name.to_string());
        while let Some(name) = current {
            let class = self.classes.get(&name)?;
            if class.methods.iter().any(|m| m == method_name) {
                return Some(format!("{name}::{method_name}"));
            }
            current = class.super_class.clone();
        }
        None
    }

    /// Resolves `super:name` starting one level above `class_name`.
    pub fn resolve_super_method(&self, class_name: &str, method_name: &str) -> Option<String> {
        let class = self.classes.get(class_name)?;
        let super_name = class.super_class.clone()?;
        self.resolve_method(&super_name, method_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistering_a_lambda_preserves_original_addresses() {
        let mut reg = FunctionRegistry::new();
        reg.register(FunctionSignature {
            name: "<lambda_0>".into(),
            parameters: vec![],
            optional_parameters: vec![],
            default_values: HashMap::new(),
            start_address: 10,
            end_address: 20,
            is_lambda: true,
            is_fallible: false,
        });
        reg.register(FunctionSignature {
            name: "<lambda_0>".into(),
            parameters: vec![],
            optional_parameters: vec![],
            default_values: HashMap::new(),
            start_address: 999,
            end_address: 999,
            is_lambda: true,
            is_fallible: false,
        });
        assert_eq!(reg.get("<lambda_0>").unwrap().start_address, 10);
    }

    #[test]
    fn method_resolution_walks_superclass_chain() {
        let mut classes = ClassRegistry::new();
        classes.begin_class("Animal");
        classes.register_method("Animal", "speak");
        classes.begin_class("Dog");
        classes.set_superclass("Dog", "Animal");
        assert_eq!(classes.resolve_method("Dog", "speak"), Some("Animal::speak".to_string()));
    }

    #[test]
    fn super_call_starts_one_level_above() {
        let mut classes = ClassRegistry::new();
        classes.begin_class("Animal");
        classes.register_method("Animal", "speak");
        classes.begin_class("Dog");
        classes.set_superclass("Dog", "Animal");
        classes.register_method("Dog", "speak");
        assert_eq!(classes.resolve_super_method("Dog", "speak"), Some("Animal::speak".to_string()));
    }
}
