//! Caller-name tagging for log lines.
//!
//! Rule-programming code logs which operation installed a rule. Rather than
//! walking the stack at runtime, [`name!`] resolves the enclosing function
//! name at compile time via the type name of a local item.

/// Expands to the unqualified name of the enclosing function.
///
/// ```
/// fn setup_bridge() -> &'static str {
///     keel_common::caller::name!()
/// }
/// assert_eq!(setup_bridge(), "setup_bridge");
/// ```
#[macro_export]
macro_rules! caller_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        // "path::to::enclosing::f" -> "enclosing"
        let name = name.strip_suffix("::f").unwrap_or(name);
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        match name.rfind(':') {
            Some(i) => &name[i + 1..],
            None => name,
        }
    }};
}

pub use crate::caller_name as name;

#[cfg(test)]
mod tests {
    #[test]
    fn resolves_enclosing_function() {
        assert_eq!(crate::caller::name!(), "resolves_enclosing_function");
    }

    #[test]
    fn strips_module_path() {
        fn deeply_nested() -> &'static str {
            crate::caller::name!()
        }
        assert_eq!(deeply_nested(), "deeply_nested");
    }
}
