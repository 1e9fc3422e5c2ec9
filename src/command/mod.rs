//! Command descriptor registry and key extraction
//!
//! Static, immutable metadata per command: arity, read-only and pub/sub
//! flags, taint behavior, and the key-location rules the router needs for
//! slot computation. Built once at startup, looked up case-insensitively,
//! never mutated at runtime.

pub mod slot;

use crate::error::{KvError, Result};
use crate::protocol::encoder;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::OnceLock;

pub use slot::{key_slot, SLOT_COUNT};

/// Where the key search begins in the argument list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BeginSearch {
    /// Keys start at a fixed argument index (command token is index 0).
    Index(usize),
    /// Keys start right after a named keyword argument, searched from
    /// `start_from`.
    Keyword {
        keyword: &'static str,
        start_from: usize,
    },
}

/// How keys are found once the search start is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FindKeys {
    /// Contiguous range: `last_key` relative to the first key (negative
    /// counts from the end of the arguments), stepping by `step`. A `limit`
    /// factor > 1 restricts the range to the first 1/limit of the remaining
    /// arguments.
    Range {
        last_key: i32,
        step: usize,
        limit: usize,
    },
    /// An explicit key-count argument at `keynum_idx` (relative to the
    /// search start) followed by that many keys from `first_key`, stepping
    /// by `step`.
    Keynum {
        keynum_idx: usize,
        first_key: usize,
        step: usize,
    },
}

/// Static metadata for one command.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub name: &'static str,
    /// Exact argument count if positive, "at least |n|" if negative. Counts
    /// the command token itself.
    pub arity: i16,
    pub readonly: bool,
    pub pubsub: bool,
    /// Sending this command leaves session state on the connection (AUTH,
    /// SELECT, subscriptions), making it unsafe to return to the pool.
    pub taints: bool,
    pub key_spec: Option<(BeginSearch, FindKeys)>,
    /// Keys cannot be located by the static rules; a dedicated extractor or
    /// master routing is required.
    pub movable: bool,
}

impl CommandDescriptor {
    const fn new(name: &'static str, arity: i16) -> Self {
        Self {
            name,
            arity,
            readonly: false,
            pubsub: false,
            taints: false,
            key_spec: None,
            movable: false,
        }
    }

    const fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    const fn pubsub(mut self) -> Self {
        self.pubsub = true;
        self
    }

    const fn taints(mut self) -> Self {
        self.taints = true;
        self
    }

    const fn movable(mut self) -> Self {
        self.movable = true;
        self
    }

    /// Contiguous keys starting at `first`, `last_key` relative (negative =
    /// from the end), stepping by `step`.
    const fn keys(mut self, first: usize, last_key: i32, step: usize) -> Self {
        self.key_spec = Some((
            BeginSearch::Index(first),
            FindKeys::Range {
                last_key,
                step,
                limit: 0,
            },
        ));
        self
    }

    /// Single key at a fixed index.
    const fn key_at(self, index: usize) -> Self {
        self.keys(index, 0, 1)
    }

    pub fn arity_ok(&self, argc: usize) -> bool {
        if self.arity >= 0 {
            argc == self.arity as usize
        } else {
            argc >= (-self.arity) as usize
        }
    }
}

macro_rules! commands {
    ($($desc:expr),* $(,)?) => {
        [$($desc),*]
    };
}

fn build_registry() -> HashMap<&'static str, CommandDescriptor> {
    use CommandDescriptor as C;

    let table = commands![
        // Strings
        C::new("GET", 2).readonly().key_at(1),
        C::new("SET", -3).key_at(1),
        C::new("SETNX", 3).key_at(1),
        C::new("SETEX", 4).key_at(1),
        C::new("PSETEX", 4).key_at(1),
        C::new("GETSET", 3).key_at(1),
        C::new("GETDEL", 2).key_at(1),
        C::new("GETEX", -2).key_at(1),
        C::new("APPEND", 3).key_at(1),
        C::new("STRLEN", 2).readonly().key_at(1),
        C::new("INCR", 2).key_at(1),
        C::new("DECR", 2).key_at(1),
        C::new("INCRBY", 3).key_at(1),
        C::new("DECRBY", 3).key_at(1),
        C::new("INCRBYFLOAT", 3).key_at(1),
        C::new("GETRANGE", 4).readonly().key_at(1),
        C::new("SETRANGE", 4).key_at(1),
        C::new("SETBIT", 4).key_at(1),
        C::new("GETBIT", 3).readonly().key_at(1),
        C::new("BITCOUNT", -2).readonly().key_at(1),
        C::new("BITPOS", -3).readonly().key_at(1),
        C::new("BITOP", -4).keys(2, -1, 1),
        C::new("MGET", -2).readonly().keys(1, -1, 1),
        C::new("MSET", -3).keys(1, -1, 2),
        C::new("MSETNX", -3).keys(1, -1, 2),
        // Generic key commands
        C::new("DEL", -2).keys(1, -1, 1),
        C::new("UNLINK", -2).keys(1, -1, 1),
        C::new("EXISTS", -2).readonly().keys(1, -1, 1),
        C::new("TOUCH", -2).keys(1, -1, 1),
        C::new("EXPIRE", -3).key_at(1),
        C::new("PEXPIRE", -3).key_at(1),
        C::new("EXPIREAT", -3).key_at(1),
        C::new("PEXPIREAT", -3).key_at(1),
        C::new("TTL", 2).readonly().key_at(1),
        C::new("PTTL", 2).readonly().key_at(1),
        C::new("PERSIST", 2).key_at(1),
        C::new("TYPE", 2).readonly().key_at(1),
        C::new("RENAME", 3).keys(1, 1, 1),
        C::new("RENAMENX", 3).keys(1, 1, 1),
        C::new("COPY", -3).keys(1, 1, 1),
        C::new("DUMP", 2).readonly().key_at(1),
        C::new("RESTORE", -4).key_at(1),
        // Hashes
        C::new("HGET", 3).readonly().key_at(1),
        C::new("HSET", -4).key_at(1),
        C::new("HSETNX", 4).key_at(1),
        C::new("HMGET", -3).readonly().key_at(1),
        C::new("HMSET", -4).key_at(1),
        C::new("HDEL", -3).key_at(1),
        C::new("HLEN", 2).readonly().key_at(1),
        C::new("HEXISTS", 3).readonly().key_at(1),
        C::new("HKEYS", 2).readonly().key_at(1),
        C::new("HVALS", 2).readonly().key_at(1),
        C::new("HGETALL", 2).readonly().key_at(1),
        C::new("HSTRLEN", 3).readonly().key_at(1),
        C::new("HINCRBY", 4).key_at(1),
        C::new("HINCRBYFLOAT", 4).key_at(1),
        C::new("HRANDFIELD", -2).readonly().key_at(1),
        C::new("HSCAN", -3).readonly().key_at(1),
        // Lists
        C::new("LPUSH", -3).key_at(1),
        C::new("RPUSH", -3).key_at(1),
        C::new("LPUSHX", -3).key_at(1),
        C::new("RPUSHX", -3).key_at(1),
        C::new("LPOP", -2).key_at(1),
        C::new("RPOP", -2).key_at(1),
        C::new("LLEN", 2).readonly().key_at(1),
        C::new("LRANGE", 4).readonly().key_at(1),
        C::new("LREM", 4).key_at(1),
        C::new("LSET", 4).key_at(1),
        C::new("LTRIM", 4).key_at(1),
        C::new("LINDEX", 3).readonly().key_at(1),
        C::new("LINSERT", 5).key_at(1),
        C::new("LPOS", -3).readonly().key_at(1),
        C::new("RPOPLPUSH", 3).keys(1, 1, 1),
        C::new("LMOVE", 5).keys(1, 1, 1),
        C::new("BLPOP", -3).keys(1, -2, 1),
        C::new("BRPOP", -3).keys(1, -2, 1),
        C::new("BLMOVE", 6).keys(1, 1, 1),
        C::new("BRPOPLPUSH", 4).keys(1, 1, 1),
        // Sets
        C::new("SADD", -3).key_at(1),
        C::new("SREM", -3).key_at(1),
        C::new("SMEMBERS", 2).readonly().key_at(1),
        C::new("SISMEMBER", 3).readonly().key_at(1),
        C::new("SMISMEMBER", -3).readonly().key_at(1),
        C::new("SCARD", 2).readonly().key_at(1),
        C::new("SPOP", -2).key_at(1),
        C::new("SRANDMEMBER", -2).readonly().key_at(1),
        C::new("SMOVE", 4).keys(1, 1, 1),
        C::new("SSCAN", -3).readonly().key_at(1),
        C::new("SUNION", -2).readonly().keys(1, -1, 1),
        C::new("SINTER", -2).readonly().keys(1, -1, 1),
        C::new("SDIFF", -2).readonly().keys(1, -1, 1),
        C::new("SUNIONSTORE", -3).keys(1, -1, 1),
        C::new("SINTERSTORE", -3).keys(1, -1, 1),
        C::new("SDIFFSTORE", -3).keys(1, -1, 1),
        // Sorted sets
        C::new("ZADD", -4).key_at(1),
        C::new("ZSCORE", 3).readonly().key_at(1),
        C::new("ZMSCORE", -3).readonly().key_at(1),
        C::new("ZINCRBY", 4).key_at(1),
        C::new("ZCARD", 2).readonly().key_at(1),
        C::new("ZCOUNT", 4).readonly().key_at(1),
        C::new("ZRANGE", -4).readonly().key_at(1),
        C::new("ZREVRANGE", -4).readonly().key_at(1),
        C::new("ZRANGEBYSCORE", -4).readonly().key_at(1),
        C::new("ZREVRANGEBYSCORE", -4).readonly().key_at(1),
        C::new("ZRANK", -3).readonly().key_at(1),
        C::new("ZREVRANK", -3).readonly().key_at(1),
        C::new("ZREM", -3).key_at(1),
        C::new("ZREMRANGEBYRANK", 4).key_at(1),
        C::new("ZREMRANGEBYSCORE", 4).key_at(1),
        C::new("ZPOPMIN", -2).key_at(1),
        C::new("ZPOPMAX", -2).key_at(1),
        C::new("BZPOPMIN", -3).keys(1, -2, 1),
        C::new("BZPOPMAX", -3).keys(1, -2, 1),
        C::new("ZSCAN", -3).readonly().key_at(1),
        C::new("ZRANGESTORE", -5).keys(1, 1, 1),
        // Streams
        C::new("XADD", -5).key_at(1),
        C::new("XLEN", 2).readonly().key_at(1),
        C::new("XRANGE", -4).readonly().key_at(1),
        C::new("XREVRANGE", -4).readonly().key_at(1),
        C::new("XDEL", -3).key_at(1),
        C::new("XTRIM", -4).key_at(1),
        C::new("XACK", -4).key_at(1),
        // Movable / variable key layouts (dedicated extractors)
        C::new("EVAL", -3).movable(),
        C::new("EVALSHA", -3).movable(),
        C::new("EVAL_RO", -3).readonly().movable(),
        C::new("EVALSHA_RO", -3).readonly().movable(),
        C::new("FCALL", -3).movable(),
        C::new("FCALL_RO", -3).readonly().movable(),
        C::new("ZUNIONSTORE", -4).movable(),
        C::new("ZINTERSTORE", -4).movable(),
        C::new("ZDIFFSTORE", -4).movable(),
        C::new("ZUNION", -3).readonly().movable(),
        C::new("ZINTER", -3).readonly().movable(),
        C::new("ZDIFF", -3).readonly().movable(),
        C::new("SINTERCARD", -3).readonly().movable(),
        C::new("LMPOP", -4).movable(),
        C::new("ZMPOP", -4).movable(),
        C::new("BLMPOP", -5).movable(),
        C::new("BZMPOP", -5).movable(),
        C::new("SORT", -2).movable(),
        C::new("SORT_RO", -2).readonly().movable(),
        C::new("GEORADIUS", -6).movable(),
        C::new("GEORADIUS_RO", -6).readonly().movable(),
        C::new("GEORADIUSBYMEMBER", -5).movable(),
        C::new("GEORADIUSBYMEMBER_RO", -5).readonly().movable(),
        C::new("MIGRATE", -6).movable(),
        C::new("XREAD", -4).readonly().movable(),
        C::new("XREADGROUP", -7).movable(),
        // Geo (static keys)
        C::new("GEOADD", -5).key_at(1),
        C::new("GEOPOS", -2).readonly().key_at(1),
        C::new("GEODIST", -4).readonly().key_at(1),
        C::new("GEOHASH", -2).readonly().key_at(1),
        C::new("GEOSEARCH", -7).readonly().key_at(1),
        C::new("GEOSEARCHSTORE", -8).keys(1, 1, 1),
        // Keyless / server / connection
        C::new("PING", -1).readonly(),
        C::new("ECHO", 2).readonly(),
        C::new("DBSIZE", 1).readonly(),
        C::new("KEYS", 2).readonly(),
        C::new("SCAN", -2).readonly(),
        C::new("FLUSHDB", -1),
        C::new("FLUSHALL", -1),
        C::new("INFO", -1).readonly(),
        C::new("TIME", 1).readonly(),
        C::new("COMMAND", -1).readonly(),
        C::new("CONFIG", -2),
        C::new("CLUSTER", -2),
        C::new("CLIENT", -2),
        C::new("WAIT", 3),
        C::new("SCRIPT", -2),
        C::new("FUNCTION", -2),
        C::new("SHUTDOWN", -1),
        C::new("ASKING", 1),
        C::new("AUTH", -2).taints(),
        C::new("SELECT", 2).taints(),
        C::new("HELLO", -1).taints(),
        C::new("READONLY", 1).taints(),
        C::new("READWRITE", 1).taints(),
        // Pub/sub
        C::new("SUBSCRIBE", -2).pubsub().taints(),
        C::new("UNSUBSCRIBE", -1).pubsub().taints(),
        C::new("PSUBSCRIBE", -2).pubsub().taints(),
        C::new("PUNSUBSCRIBE", -1).pubsub().taints(),
        C::new("PUBLISH", 3).pubsub(),
        C::new("SPUBLISH", 3).pubsub().key_at(1),
        C::new("SSUBSCRIBE", -2).pubsub().taints().keys(1, -1, 1),
        C::new("SUNSUBSCRIBE", -1).pubsub().taints(),
    ];

    let mut map = HashMap::with_capacity(table.len());
    for desc in table {
        map.insert(desc.name, desc);
    }
    map
}

/// The process-wide command registry, built once and read-only thereafter.
pub fn registry() -> &'static HashMap<&'static str, CommandDescriptor> {
    static REGISTRY: OnceLock<HashMap<&'static str, CommandDescriptor>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

/// Case-insensitive descriptor lookup.
pub fn lookup(name: &[u8]) -> Option<&'static CommandDescriptor> {
    let upper = String::from_utf8_lossy(name).to_ascii_uppercase();
    registry().get(upper.as_str())
}

/// Case-insensitive keyword search through the argument list.
fn find_keyword(args: &[Bytes], keyword: &str, start_from: usize) -> Option<usize> {
    args.iter()
        .enumerate()
        .skip(start_from)
        .find(|(_, arg)| arg.eq_ignore_ascii_case(keyword.as_bytes()))
        .map(|(i, _)| i)
}

fn parse_count(arg: &Bytes) -> Result<usize> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| KvError::Protocol("malformed key count argument".to_string()))
}

/// Compute the argument indexes holding keys, per the descriptor's static
/// rules. Movable commands go through [`extract_movable`].
fn extract_static(spec: &(BeginSearch, FindKeys), args: &[Bytes]) -> Result<Vec<usize>> {
    let (begin, find) = spec;

    let first = match *begin {
        BeginSearch::Index(i) => i,
        BeginSearch::Keyword {
            keyword,
            start_from,
        } => match find_keyword(args, keyword, start_from) {
            Some(i) => i + 1,
            None => return Ok(Vec::new()),
        },
    };
    if first >= args.len() {
        return Ok(Vec::new());
    }

    match *find {
        FindKeys::Range {
            last_key,
            step,
            limit,
        } => {
            let last = if last_key >= 0 {
                first + last_key as usize
            } else if limit > 1 {
                first + (args.len() - first) / limit - 1
            } else {
                // Counted from the end: -1 is the final argument.
                (args.len() as i32 + last_key) as usize
            };
            if last >= args.len() {
                return Err(KvError::Protocol("key position out of range".to_string()));
            }
            Ok((first..=last).step_by(step).collect())
        }
        FindKeys::Keynum {
            keynum_idx,
            first_key,
            step,
        } => {
            let count_arg = args
                .get(first + keynum_idx)
                .ok_or_else(|| KvError::Protocol("missing key count argument".to_string()))?;
            let count = parse_count(count_arg)?;
            if count == 0 {
                return Ok(Vec::new());
            }
            let start = first + first_key;
            // The count comes straight from the caller's arguments; bound it
            // against the argument list before sizing anything by it.
            let last = (count - 1)
                .checked_mul(step)
                .and_then(|span| span.checked_add(start))
                .filter(|&last| last < args.len())
                .ok_or_else(|| KvError::Protocol("key position out of range".to_string()))?;
            Ok((start..=last).step_by(step).collect())
        }
    }
}

/// Dedicated extraction for commands whose key layout is not expressible by
/// the static rules.
fn extract_movable(name: &str, args: &[Bytes]) -> Result<Vec<usize>> {
    match name {
        // <cmd> script|sha|fn numkeys key [key ...]
        "EVAL" | "EVALSHA" | "EVAL_RO" | "EVALSHA_RO" | "FCALL" | "FCALL_RO" => {
            extract_static(
                &(
                    BeginSearch::Index(2),
                    FindKeys::Keynum {
                        keynum_idx: 0,
                        first_key: 1,
                        step: 1,
                    },
                ),
                args,
            )
        }
        // <cmd> dest numkeys key [key ...]
        "ZUNIONSTORE" | "ZINTERSTORE" | "ZDIFFSTORE" => {
            let mut positions = vec![1];
            positions.extend(extract_static(
                &(
                    BeginSearch::Index(2),
                    FindKeys::Keynum {
                        keynum_idx: 0,
                        first_key: 1,
                        step: 1,
                    },
                ),
                args,
            )?);
            Ok(positions)
        }
        // <cmd> numkeys key [key ...]
        "ZUNION" | "ZINTER" | "ZDIFF" | "SINTERCARD" | "LMPOP" | "ZMPOP" => extract_static(
            &(
                BeginSearch::Index(1),
                FindKeys::Keynum {
                    keynum_idx: 0,
                    first_key: 1,
                    step: 1,
                },
            ),
            args,
        ),
        // <cmd> timeout numkeys key [key ...]
        "BLMPOP" | "BZMPOP" => extract_static(
            &(
                BeginSearch::Index(2),
                FindKeys::Keynum {
                    keynum_idx: 0,
                    first_key: 1,
                    step: 1,
                },
            ),
            args,
        ),
        // SORT key ... [STORE dest]
        "SORT" | "SORT_RO" => {
            let mut positions = vec![1];
            if name == "SORT" {
                if let Some(kw) = find_keyword(args, "STORE", 2) {
                    if kw + 1 < args.len() {
                        positions.push(kw + 1);
                    }
                }
            }
            Ok(positions)
        }
        // GEORADIUS key ... [STORE dest] [STOREDIST dest]
        "GEORADIUS" | "GEORADIUS_RO" | "GEORADIUSBYMEMBER" | "GEORADIUSBYMEMBER_RO" => {
            let mut positions = vec![1];
            if !name.ends_with("_RO") {
                for kw_name in ["STORE", "STOREDIST"] {
                    if let Some(kw) = find_keyword(args, kw_name, 2) {
                        if kw + 1 < args.len() {
                            positions.push(kw + 1);
                        }
                    }
                }
            }
            Ok(positions)
        }
        // MIGRATE host port key db timeout [... KEYS key [key ...]]
        "MIGRATE" => {
            let mut positions = Vec::new();
            if args.len() > 3 && !args[3].is_empty() {
                positions.push(3);
            }
            if let Some(kw) = find_keyword(args, "KEYS", 6) {
                positions.extend(kw + 1..args.len());
            }
            Ok(positions)
        }
        // XREAD ... STREAMS key [key ...] id [id ...]
        "XREAD" | "XREADGROUP" => {
            let kw = find_keyword(args, "STREAMS", 1)
                .ok_or_else(|| KvError::Protocol("missing STREAMS keyword".to_string()))?;
            let tail = args.len() - (kw + 1);
            if tail == 0 || tail % 2 != 0 {
                return Err(KvError::Protocol(
                    "unbalanced STREAMS key/id list".to_string(),
                ));
            }
            Ok((kw + 1..kw + 1 + tail / 2).collect())
        }
        _ => Ok(Vec::new()),
    }
}

/// Extract key argument positions for a command.
pub fn extract_key_positions(
    desc: &CommandDescriptor,
    args: &[Bytes],
) -> Result<Vec<usize>> {
    if desc.movable {
        extract_movable(desc.name, args)
    } else if let Some(spec) = &desc.key_spec {
        extract_static(spec, args)
    } else {
        Ok(Vec::new())
    }
}

/// An immutable request: the encoded argument list plus the key metadata the
/// router needs. Reusable across retries.
#[derive(Debug, Clone)]
pub struct Request {
    args: Vec<Bytes>,
    descriptor: Option<&'static CommandDescriptor>,
    key_positions: Vec<usize>,
    slots: Vec<u16>,
    /// Resolved slot, or -1 for keyless requests.
    slot: i32,
}

impl Request {
    /// Build a request from an argument list (command token first),
    /// validating arity and resolving key slots.
    pub fn new<I, B>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let args: Vec<Bytes> = parts.into_iter().map(Into::into).collect();
        if args.is_empty() {
            return Err(KvError::Protocol("empty request".to_string()));
        }

        let descriptor = lookup(&args[0]);
        let key_positions = match descriptor {
            Some(desc) => {
                if !desc.arity_ok(args.len()) {
                    return Err(KvError::WrongArgCount(desc.name.to_string()));
                }
                extract_key_positions(desc, &args)?
            }
            // Unknown commands are passed through keyless; the router sends
            // them to a master.
            None => Vec::new(),
        };

        let slots: Vec<u16> = key_positions
            .iter()
            .map(|&i| key_slot(&args[i]))
            .collect();
        let slot = match slots.first() {
            Some(&first) if slots.iter().all(|&s| s == first) => first as i32,
            _ => -1,
        };

        Ok(Self {
            args,
            descriptor,
            key_positions,
            slots,
            slot,
        })
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn command(&self) -> &Bytes {
        &self.args[0]
    }

    pub fn descriptor(&self) -> Option<&'static CommandDescriptor> {
        self.descriptor
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.key_positions.iter().map(|&i| &self.args[i])
    }

    pub fn key_positions(&self) -> &[usize] {
        &self.key_positions
    }

    /// Per-key slots, in key order.
    pub fn slots(&self) -> &[u16] {
        &self.slots
    }

    /// Resolved slot: uniform key slot, or -1 when keyless or when the keys
    /// disagree (the router rejects the latter before any I/O).
    pub fn slot(&self) -> i32 {
        self.slot
    }

    pub fn is_readonly(&self) -> bool {
        self.descriptor.map(|d| d.readonly).unwrap_or(false)
    }

    pub fn taints(&self) -> bool {
        self.descriptor.map(|d| d.taints).unwrap_or(false)
    }

    /// True when routing cannot be decided client-side and a master must be
    /// chosen.
    pub fn needs_master(&self) -> bool {
        match self.descriptor {
            Some(d) => d.movable && self.key_positions.is_empty(),
            None => true,
        }
    }

    /// Encode into the wire format, appending to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let parts: Vec<&[u8]> = self.args.iter().map(|b| b.as_ref()).collect();
        encoder::encode_args(&parts, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(parts: &[&str]) -> Request {
        Request::new(parts.iter().map(|s| Bytes::from(s.to_string()))).unwrap()
    }

    fn key_strings(r: &Request) -> Vec<String> {
        r.keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(lookup(b"get").unwrap().name, "GET");
        assert_eq!(lookup(b"GeT").unwrap().name, "GET");
        assert!(lookup(b"NOSUCHCMD").is_none());
    }

    #[test]
    fn test_single_key() {
        let r = req(&["GET", "foo"]);
        assert_eq!(key_strings(&r), vec!["foo"]);
        assert_eq!(r.slot(), key_slot(b"foo") as i32);
        assert!(r.is_readonly());
    }

    #[test]
    fn test_trailing_keys_range() {
        let r = req(&["MGET", "a", "b", "c"]);
        assert_eq!(key_strings(&r), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stepped_keys() {
        let r = req(&["MSET", "k1", "v1", "k2", "v2"]);
        assert_eq!(key_strings(&r), vec!["k1", "k2"]);
    }

    #[test]
    fn test_blocking_pop_excludes_timeout() {
        let r = req(&["BLPOP", "a", "b", "0"]);
        assert_eq!(key_strings(&r), vec!["a", "b"]);
    }

    #[test]
    fn test_eval_keynum() {
        let r = req(&["EVAL", "return 1", "2", "k1", "k2", "extra"]);
        assert_eq!(key_strings(&r), vec!["k1", "k2"]);
    }

    #[test]
    fn test_eval_huge_numkeys_is_error() {
        // A numeric but absurd count must fail cleanly, never allocate by it.
        let result = Request::new(
            ["EVAL", "return 1", "10000000000000000000"]
                .iter()
                .map(|s| Bytes::from(s.to_string())),
        );
        assert!(matches!(result, Err(KvError::Protocol(_))));
    }

    #[test]
    fn test_eval_numkeys_past_end_is_error() {
        let result = Request::new(
            ["EVAL", "return 1", "3", "k1"]
                .iter()
                .map(|s| Bytes::from(s.to_string())),
        );
        assert!(matches!(result, Err(KvError::Protocol(_))));
    }

    #[test]
    fn test_eval_zero_numkeys_is_keyless() {
        let r = req(&["EVAL", "return 1", "0"]);
        assert!(key_strings(&r).is_empty());
    }

    #[test]
    fn test_zunionstore_includes_destination() {
        let r = req(&["ZUNIONSTORE", "dest", "2", "a", "b", "WEIGHTS", "1", "2"]);
        assert_eq!(key_strings(&r), vec!["dest", "a", "b"]);
    }

    #[test]
    fn test_sort_with_store() {
        let r = req(&["SORT", "mylist", "LIMIT", "0", "10", "STORE", "out"]);
        assert_eq!(key_strings(&r), vec!["mylist", "out"]);

        let r = req(&["SORT", "mylist"]);
        assert_eq!(key_strings(&r), vec!["mylist"]);
    }

    #[test]
    fn test_georadius_store_target() {
        let r = req(&[
            "GEORADIUS", "geo", "15", "37", "200", "km", "STORE", "out",
        ]);
        assert_eq!(key_strings(&r), vec!["geo", "out"]);

        let r = req(&["GEORADIUS_RO", "geo", "15", "37", "200", "km"]);
        assert_eq!(key_strings(&r), vec!["geo"]);
    }

    #[test]
    fn test_migrate_keys_keyword() {
        let r = req(&[
            "MIGRATE", "host", "7000", "", "0", "5000", "KEYS", "a", "b", "c",
        ]);
        assert_eq!(key_strings(&r), vec!["a", "b", "c"]);

        let r = req(&["MIGRATE", "host", "7000", "one", "0", "5000"]);
        assert_eq!(key_strings(&r), vec!["one"]);
    }

    #[test]
    fn test_xread_streams_interleaved() {
        let r = req(&["XREAD", "COUNT", "5", "STREAMS", "s1", "s2", "0-0", "0-0"]);
        assert_eq!(key_strings(&r), vec!["s1", "s2"]);
    }

    #[test]
    fn test_xread_unbalanced_streams_fails() {
        let result = Request::new(
            ["XREAD", "STREAMS", "s1", "s2", "0-0"]
                .iter()
                .map(|s| Bytes::from(s.to_string())),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_arity_validation() {
        assert!(matches!(
            Request::new(["GET"].iter().map(|s| Bytes::from(s.to_string()))),
            Err(KvError::WrongArgCount(_))
        ));
        assert!(matches!(
            Request::new(
                ["GET", "a", "b"].iter().map(|s| Bytes::from(s.to_string()))
            ),
            Err(KvError::WrongArgCount(_))
        ));
        // Negative arity: at least two arguments.
        assert!(Request::new(
            ["MGET", "a", "b", "c"]
                .iter()
                .map(|s| Bytes::from(s.to_string()))
        )
        .is_ok());
    }

    #[test]
    fn test_keyless_request() {
        let r = req(&["PING"]);
        assert_eq!(r.slot(), -1);
        assert_eq!(key_strings(&r), Vec::<String>::new());
    }

    #[test]
    fn test_unknown_command_routes_to_master() {
        let r = req(&["SOMEFUTURECMD", "x"]);
        assert!(r.needs_master());
        assert_eq!(r.slot(), -1);
    }

    #[test]
    fn test_taint_flags() {
        assert!(req(&["AUTH", "pw"]).taints());
        assert!(req(&["SELECT", "1"]).taints());
        assert!(req(&["SUBSCRIBE", "ch"]).taints());
        assert!(!req(&["GET", "k"]).taints());
    }

    #[test]
    fn test_hash_tag_aligns_slots() {
        let r = req(&["MGET", "{user}:a", "{user}:b"]);
        assert!(r.slot() >= 0);
        assert_eq!(r.slots()[0], r.slots()[1]);
    }

    #[test]
    fn test_cross_slot_request_has_no_uniform_slot() {
        let r = req(&["MGET", "foo", "bar"]);
        assert_eq!(r.slot(), -1);
        assert_ne!(r.slots()[0], r.slots()[1]);
    }

    #[test]
    fn test_keyword_begin_search() {
        // Exercised through the generic rule directly.
        let args: Vec<Bytes> = ["CMD", "x", "STORE", "dest"]
            .iter()
            .map(|s| Bytes::from(s.to_string()))
            .collect();
        let positions = extract_static(
            &(
                BeginSearch::Keyword {
                    keyword: "STORE",
                    start_from: 1,
                },
                FindKeys::Range {
                    last_key: 0,
                    step: 1,
                    limit: 0,
                },
            ),
            &args,
        )
        .unwrap();
        assert_eq!(positions, vec![3]);
    }
}
