use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, SourceError, SourceResult};

// One macro for every UUID-backed key so parsing and display stay identical across them.
macro_rules! define_uuid_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> SourceResult<Self> {
                let parsed = Uuid::parse_str(raw.trim()).context(InvalidIdSnafu {
                    stage: "parse-source-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = SourceError;

            fn from_str(raw: &str) -> SourceResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_uuid_id!(ConversationId, "conversation-id");
define_uuid_id!(UserId, "user-id");

/// Row identity assigned by the backend; monotonically increasing per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_parse_their_display_form() {
        let id = ConversationId::new_v7();
        let parsed = ConversationId::parse(&id.to_string()).expect("display form parses");
        assert_eq!(parsed, id);

        let padded: UserId = format!("  {}  ", id.as_uuid()).parse().expect("trimmed");
        assert_eq!(padded.as_uuid(), id.as_uuid());
    }

    #[test]
    fn invalid_id_reports_type_and_raw_text() {
        let error = UserId::parse("not-a-uuid").expect_err("must reject");
        match error {
            SourceError::InvalidId { id_type, raw, .. } => {
                assert_eq!(id_type, "user-id");
                assert_eq!(raw, "not-a-uuid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
