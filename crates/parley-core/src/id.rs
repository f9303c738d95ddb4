use parking_lot::Mutex;
use rand::Rng;

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LENGTH: usize = 26;
const TIME_DIGITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Ask,
    Turn,
}

impl Prefix {
    fn as_str(&self) -> &'static str {
        match self {
            Prefix::Ask => "ask",
            Prefix::Turn => "trn",
        }
    }
}

/// Last millisecond handed out plus the counter within it.
static CLOCK: Mutex<(u64, u32)> = Mutex::new((0, 0));

fn random_base62(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| BASE62_CHARS[rng.gen_range(0..62)] as char)
        .collect()
}

fn next_tick(timestamp: u64) -> u64 {
    let mut clock = CLOCK.lock();
    if clock.0 != timestamp {
        *clock = (timestamp, 0);
    }
    clock.1 += 1;
    timestamp * 0x1000 + u64::from(clock.1)
}

/// Creates a sortable id: `<prefix>_<16 hex time digits><random base62>`.
pub fn create(prefix: Prefix, timestamp: Option<u64>) -> String {
    let millis = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis().max(0) as u64);
    let tick = next_tick(millis);

    format!(
        "{}_{}{}",
        prefix.as_str(),
        hex::encode(tick.to_be_bytes()),
        random_base62(LENGTH - TIME_DIGITS)
    )
}

pub fn ask() -> String {
    create(Prefix::Ask, None)
}

pub fn timestamp(id: &str) -> Option<u64> {
    let (_, rest) = id.split_once('_')?;
    let hex = rest.get(0..TIME_DIGITS)?;
    let encoded = u64::from_str_radix(hex, 16).ok()?;
    Some(encoded / 0x1000)
}

pub fn validate_prefix(id: &str, expected: Prefix) -> bool {
    id.split_once('_')
        .is_some_and(|(prefix, _)| prefix == expected.as_str())
}
