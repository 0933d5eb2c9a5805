//! Macros for defining typed ID types.

/// Macro to define a typed, UUID-backed ID.
///
/// This generates a newtype wrapper around the canonical string with:
/// - A `KIND` constant used in error messages
/// - `generate()` to mint a fresh random (v4) ID
/// - `parse()` to strictly parse user input
/// - `From<&str>` / `From<String>` for opaque persisted values
/// - `Display`, `FromStr`, `Serialize` and `Deserialize` implementations
///
/// # Example
///
/// ```ignore
/// define_id!(AllocId, "allocation");
///
/// let id = AllocId::generate();
/// let parsed: AllocId = id.as_str().parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        /// A typed ID for this object type.
        ///
        /// The default value is the unset (empty) ID.
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Human readable object kind for this ID type.
            pub const KIND: &'static str = $kind;

            /// Creates a new ID from a fresh random UUID.
            #[must_use]
            pub fn generate() -> Self {
                Self($crate::Uuid::new_v4().hyphenated().to_string())
            }

            /// Creates an ID from a raw UUID.
            #[must_use]
            pub fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid.hyphenated().to_string())
            }

            /// Parses an ID from user input.
            ///
            /// The string must be a lowercase hyphenated UUID.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let uuid = $crate::Uuid::try_parse(s).map_err(|e| $crate::IdError::InvalidUuid {
                    kind: Self::KIND,
                    value: s.to_string(),
                    reason: e.to_string(),
                })?;

                let canonical = uuid.hyphenated().to_string();
                if canonical != s {
                    return Err($crate::IdError::NotCanonical {
                        kind: Self::KIND,
                        value: s.to_string(),
                    });
                }

                Ok(Self(canonical))
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true for the unset ID.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Returns true if the ID is a canonical UUID.
            #[must_use]
            pub fn is_uuid(&self) -> bool {
                Self::parse(&self.0).is_ok()
            }

            /// Returns the 8 character prefix used in human output.
            #[must_use]
            pub fn short(&self) -> &str {
                self.0.get(..8).unwrap_or(&self.0)
            }

            /// Consumes the ID, returning the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                // Persisted IDs are opaque; strict parsing applies to user input only.
                let s = String::deserialize(deserializer)?;
                Ok(Self(s))
            }
        }
    };
}
