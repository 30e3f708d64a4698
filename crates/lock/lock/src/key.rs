use std::fmt::Display;

/// Short name of `T`: no module path, no generic arguments.
///
/// `keyward_lock::key::Order` becomes `Order`, `Vec<u8>` becomes `Vec`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Derive a lock key for `value` from one of its fields.
///
/// The key is `"<TypeName>:<field>"`. Separators at either end are trimmed, so
/// an empty field yields just the type name.
pub fn derive_key<T, F, V>(value: &T, selector: F) -> String
where
    T: ?Sized,
    F: FnOnce(&T) -> V,
    V: Display,
{
    let field = selector(value).to_string();
    format!("{}:{field}", short_type_name::<T>())
        .trim_matches(':')
        .to_owned()
}
