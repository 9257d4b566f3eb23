/// Implements `Display` for a `Serialize` type by pretty-printing it as
/// JSON, falling back to `Debug` if serialization ever fails.
#[macro_export]
macro_rules! impl_display_using_json_pretty {
    ($type:ty) => {
        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match serde_json::to_string(self) {
                    Ok(s) => write!(f, "{}", s),
                    Err(_) => write!(f, "{:?}", self),
                }
            }
        }
    };
}
