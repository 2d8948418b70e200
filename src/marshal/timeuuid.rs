use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use uuid::{Context, Timestamp, Uuid};

use super::MarshalError;

static CLOCK: LazyLock<Context> = LazyLock::new(|| Context::new(rand::random()));

// Random node id with the multicast bit set, as RFC 4122 asks of non-MAC ids.
static NODE: LazyLock<[u8; 6]> = LazyLock::new(|| {
    let mut node: [u8; 6] = rand::random();
    node[0] |= 0x01;
    node
});

/// Builds a version-1 UUID embedding `at`. Ids built from increasing instants
/// sort in time order on the store, which makes them usable as row or column
/// key components; the shared clock sequence keeps ids minted within the same
/// 100ns tick distinct. Instants before the Unix epoch are rejected.
pub fn time_uuid(at: DateTime<Utc>) -> Result<Uuid, MarshalError> {
    let seconds = u64::try_from(at.timestamp()).map_err(|_| MarshalError::Overflow {
        type_name: "TimeUUIDType",
        value: at.to_rfc3339(),
    })?;
    let ts = Timestamp::from_unix(&*CLOCK, seconds, at.timestamp_subsec_nanos());
    Ok(Uuid::new_v1(ts, &NODE))
}

/// Recovers the instant embedded in a time-based UUID.
pub fn time_uuid_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    let (seconds, nanos) = id.get_timestamp()?.to_unix();
    DateTime::<Utc>::from_timestamp(i64::try_from(seconds).ok()?, nanos)
}
