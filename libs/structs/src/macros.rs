//! Macros for user-facing string enumerations.

/// Defines an enumeration carried on the wire as a string.
///
/// Values this version does not recognize deserialize into `Unknown` and keep
/// the submitted text, so validation can name it in its error message.
///
/// ```ignore
/// string_enum! {
///     pub enum DelayFunction {
///         Constant => "constant",
///         Exponential => "exponential",
///     }
/// }
/// ```
#[macro_export]
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(from = "String", into = "String")]
        $vis enum $name {
            $($(#[$vmeta])* $variant,)+
            /// A value this version does not recognize, kept verbatim.
            Unknown(String),
        }

        impl $name {
            /// Wire names of every recognized value.
            pub const KNOWN: &'static [&'static str] = &[$($wire),+];

            /// Returns the wire name.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Unknown(s) => s.as_str(),
                }
            }

            /// Parses a wire name; unrecognized input becomes `Unknown`.
            pub fn parse(s: &str) -> Self {
                match s {
                    $($wire => Self::$variant,)+
                    other => Self::Unknown(other.to_string()),
                }
            }

            /// Returns false for `Unknown` values.
            pub fn is_known(&self) -> bool {
                !matches!(self, Self::Unknown(_))
            }

            /// Returns true for the empty, unset value.
            pub fn is_unset(&self) -> bool {
                matches!(self, Self::Unknown(s) if s.is_empty())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::parse(&s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.as_str().to_string()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}
