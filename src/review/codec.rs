//! Cache wire format.
//!
//! The cache travels as one or more technical comments posted by the bot:
//!
//! ```text
//! signbot internal usage
//! <!-- bot cache: PAYLOAD -->
//! ```
//!
//! `PAYLOAD` is canonical JSON, or `b64:` + base64(gzip(JSON)) once the JSON
//! exceeds the chunk threshold. Long payloads are split into threshold-sized
//! chunks, one per comment.
//!
//! Each chunk names its generation and position on the marker line
//! (`signbot internal usage [<generation> <i>/<n>]`). The generation is a
//! digest of the whole payload, so a set of chunks is only decoded when every
//! part is present and the digest matches. A new generation is written in full
//! before the previous one is deleted.
//!
//! Caches written by the previous generation of the bot
//! (`{signatures: {comment: sha}, commits: {sha: {time, files, squashed}}}`)
//! are migrated on read and only ever written back in the current form.

use crate::core::error::SignbotError;
use crate::core::time;
use crate::review::cache::{BotCache, CommentEntry, CommentKind, CommitEntry, FvKey};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

pub const CACHE_MARKER: &str = "signbot internal usage";
const BODY_PREFIX: &str = "<!-- bot cache: ";
const BODY_SUFFIX: &str = " -->";
const COMPRESSED_PREFIX: &str = "b64:";
const GENERATION_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWrite {
    Update { id: u64, body: String },
    Create { body: String },
    Delete { id: u64 },
}

/// Position of one chunk within its generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub generation: String,
    /// Zero-based.
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub cache: BotCache,
    pub warnings: Vec<String>,
    pub migrated: bool,
}

#[derive(Debug, Clone)]
pub struct CacheCodec {
    threshold: usize,
}

impl CacheCodec {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn canonical_json(cache: &BotCache) -> Result<String, SignbotError> {
        Ok(serde_json::to_string(cache)?)
    }

    pub fn encode(&self, cache: &BotCache) -> Result<Vec<String>, SignbotError> {
        let json = Self::canonical_json(cache)?;
        if json.len() <= self.threshold {
            return Ok(vec![json]);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes())?;
        let compressed = encoder.finish()?;
        let payload = format!("{}{}", COMPRESSED_PREFIX, STANDARD.encode(compressed));
        // base64 output is ASCII, so byte chunks are char chunks.
        Ok(payload
            .as_bytes()
            .chunks(self.threshold)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect())
    }

    pub fn decode<S: AsRef<str>>(&self, chunks: &[S]) -> Result<Decoded, SignbotError> {
        let joined: String = chunks.iter().map(|c| c.as_ref()).collect();
        if joined.trim().is_empty() {
            return Ok(Decoded::default());
        }
        let json = match joined.strip_prefix(COMPRESSED_PREFIX) {
            Some(encoded) => {
                let compressed = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| SignbotError::CodecError(format!("base64: {}", e)))?;
                let mut out = String::new();
                GzDecoder::new(compressed.as_slice())
                    .read_to_string(&mut out)
                    .map_err(|e| SignbotError::CodecError(format!("gzip: {}", e)))?;
                out
            }
            None => joined,
        };
        let value: Value = serde_json::from_str(&json)
            .map_err(|e| SignbotError::CodecError(format!("json: {}", e)))?;
        let Value::Object(obj) = value else {
            return Err(SignbotError::CodecError("cache is not an object".to_string()));
        };
        let mut warnings = Vec::new();
        if is_legacy(&obj) {
            let cache = migrate_legacy(&obj, &mut warnings);
            return Ok(Decoded {
                cache,
                warnings,
                migrated: true,
            });
        }
        let cache = BotCache {
            emoji: section(&obj, "emoji", |k| k.parse::<u64>().ok(), &mut warnings),
            fv: section(&obj, "fv", |k| Some(FvKey::parse(k)), &mut warnings),
            comments: section(&obj, "comments", |k| k.parse::<u64>().ok(), &mut warnings),
            commits: section(&obj, "commits", |k| Some(k.to_string()), &mut warnings),
            head: obj.get("head").and_then(Value::as_str).map(str::to_string),
        };
        Ok(Decoded {
            cache,
            warnings,
            migrated: false,
        })
    }

    /// Comment bodies for `cache`, one per chunk, all of one generation.
    pub fn bodies(&self, cache: &BotCache) -> Result<Vec<String>, SignbotError> {
        let chunks = self.encode(cache)?;
        let generation = generation_of(&chunks.concat());
        let total = chunks.len();
        Ok(chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let part = Part {
                    generation: generation.clone(),
                    index,
                    total,
                };
                Self::render(&part, chunk)
            })
            .collect())
    }

    /// Decode the cache from the bot's technical comments, oldest first.
    ///
    /// The newest complete generation wins. Incomplete or corrupt generations
    /// are ignored with a warning. Bodies without a part header come from
    /// the previous format and are joined in order, but only when no complete
    /// generation exists.
    pub fn decode_bodies<S: AsRef<str>>(&self, bodies: &[S]) -> Result<Decoded, SignbotError> {
        let mut generations: BTreeMap<String, Generation> = BTreeMap::new();
        let mut unframed = Vec::new();
        for (position, body) in bodies.iter().enumerate() {
            let body = body.as_ref();
            let Some(chunk) = Self::extract(body) else {
                continue;
            };
            let Some(part) = Self::part(body) else {
                unframed.push(chunk);
                continue;
            };
            let generation = generations.entry(part.generation).or_insert_with(|| Generation {
                total: part.total,
                parts: BTreeMap::new(),
                last_seen: position,
            });
            generation.last_seen = position;
            if part.total == generation.total {
                generation.parts.insert(part.index, chunk);
            }
        }

        let mut warnings = Vec::new();
        let mut newest: Option<(usize, String)> = None;
        for (id, generation) in &generations {
            if generation.parts.len() != generation.total {
                warnings.push(format!(
                    "cache generation {} is incomplete ({} of {} parts), ignored",
                    id,
                    generation.parts.len(),
                    generation.total
                ));
                continue;
            }
            let payload: String = generation.parts.values().copied().collect();
            if generation_of(&payload) != *id {
                warnings.push(format!("cache generation {} fails its digest, ignored", id));
                continue;
            }
            if newest.as_ref().is_none_or(|(seen, _)| generation.last_seen > *seen) {
                newest = Some((generation.last_seen, payload));
            }
        }

        let mut decoded = match newest {
            Some((_, payload)) => self.decode(&[payload])?,
            None if !unframed.is_empty() => self.decode(&unframed)?,
            None if !generations.is_empty() => {
                return Err(SignbotError::CodecError(format!(
                    "no complete cache generation: {}",
                    warnings.join("; ")
                )));
            }
            None => Decoded::default(),
        };
        warnings.append(&mut decoded.warnings);
        decoded.warnings = warnings;
        Ok(decoded)
    }

    pub fn render(part: &Part, chunk: &str) -> String {
        format!(
            "{} [{} {}/{}]\n{}{}{}",
            CACHE_MARKER,
            part.generation,
            part.index + 1,
            part.total,
            BODY_PREFIX,
            chunk,
            BODY_SUFFIX
        )
    }

    pub fn is_cache_body(body: &str) -> bool {
        body.starts_with(CACHE_MARKER)
    }

    /// Part header on the marker line, if the body carries one.
    pub fn part(body: &str) -> Option<Part> {
        let header = body.lines().next()?.strip_prefix(CACHE_MARKER)?.trim();
        let inner = header.strip_prefix('[')?.strip_suffix(']')?;
        let (generation, position) = inner.split_once(' ')?;
        let (index, total) = position.split_once('/')?;
        let index: usize = index.parse().ok()?;
        let total: usize = total.parse().ok()?;
        if generation.is_empty() || index == 0 || index > total {
            return None;
        }
        Some(Part {
            generation: generation.to_string(),
            index: index - 1,
            total,
        })
    }

    /// Payload chunk carried by a technical comment body.
    pub fn extract(body: &str) -> Option<&str> {
        let rest = body.strip_prefix(CACHE_MARKER)?;
        let (_, rest) = rest.split_once('\n')?;
        let rest = rest.trim_start().strip_prefix(BODY_PREFIX)?;
        rest.trim_end()
            .strip_suffix(BODY_SUFFIX.trim_start())
            .map(str::trim_end)
    }

    /// Comment writes turning `existing` (creation order) into `bodies`.
    ///
    /// A lone comment is updated in place. Otherwise every missing body is
    /// created before anything stale is deleted, so a failure part-way
    /// leaves the previous generation intact.
    pub fn plan(existing: &[(u64, String)], bodies: &[String]) -> Vec<CacheWrite> {
        let unchanged = existing.len() == bodies.len()
            && existing.iter().zip(bodies).all(|((_, current), body)| current == body);
        if unchanged {
            return Vec::new();
        }
        if let ([(id, _)], [body]) = (existing, bodies) {
            return vec![CacheWrite::Update {
                id: *id,
                body: body.clone(),
            }];
        }

        let present: BTreeSet<&str> = existing.iter().map(|(_, b)| b.as_str()).collect();
        let mut writes: Vec<CacheWrite> = bodies
            .iter()
            .filter(|body| !present.contains(body.as_str()))
            .map(|body| CacheWrite::Create { body: body.clone() })
            .collect();
        let wanted: BTreeSet<&str> = bodies.iter().map(String::as_str).collect();
        let mut kept = BTreeSet::new();
        for (id, body) in existing {
            if wanted.contains(body.as_str()) && kept.insert(body.as_str()) {
                continue;
            }
            writes.push(CacheWrite::Delete { id: *id });
        }
        writes
    }
}

struct Generation<'b> {
    total: usize,
    parts: BTreeMap<usize, &'b str>,
    /// Position of the newest part in the thread.
    last_seen: usize,
}

fn generation_of(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
        .chars()
        .take(GENERATION_LEN)
        .collect()
}

/// Entry-by-entry deserialisation; a bad entry is dropped, not fatal.
fn section<K: Ord, V: DeserializeOwned>(
    obj: &Map<String, Value>,
    name: &str,
    parse_key: impl Fn(&str) -> Option<K>,
    warnings: &mut Vec<String>,
) -> BTreeMap<K, V> {
    let mut out = BTreeMap::new();
    let Some(raw) = obj.get(name) else {
        return out;
    };
    let Some(entries) = raw.as_object() else {
        warnings.push(format!("{}: expected an object, dropped", name));
        return out;
    };
    for (raw_key, raw_value) in entries {
        let Some(key) = parse_key(raw_key) else {
            warnings.push(format!("{}: bad key {:?}, dropped", name, raw_key));
            continue;
        };
        match serde_json::from_value::<V>(raw_value.clone()) {
            Ok(value) => {
                out.insert(key, value);
            }
            Err(e) => warnings.push(format!("{}.{}: {}, dropped", name, raw_key, e)),
        }
    }
    out
}

fn is_legacy(obj: &Map<String, Value>) -> bool {
    if obj.contains_key("signatures") {
        return true;
    }
    !obj.contains_key("fv")
        && obj
            .get("commits")
            .and_then(Value::as_object)
            .is_some_and(|commits| commits.values().any(|c| c.get("time").is_some()))
}

fn migrate_legacy(obj: &Map<String, Value>, warnings: &mut Vec<String>) -> BotCache {
    let mut cache = BotCache {
        emoji: section(obj, "emoji", |k| k.parse::<u64>().ok(), warnings),
        ..BotCache::default()
    };

    if let Some(commits) = obj.get("commits").and_then(Value::as_object) {
        for (sha, raw) in commits {
            let Some(ts) = raw.get("time").and_then(time::from_json) else {
                warnings.push(format!("legacy commit {}: missing time, dropped", sha));
                continue;
            };
            let fv: BTreeSet<FvKey> = raw
                .get("files")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(FvKey::bare)
                .collect();
            let squashed = raw.get("squashed").and_then(Value::as_bool).unwrap_or(false);
            cache.commits.insert(
                sha.clone(),
                CommitEntry {
                    ts,
                    fv,
                    squashed,
                    unresolved: true,
                },
            );
        }
    }

    if let Some(signatures) = obj.get("signatures").and_then(Value::as_object) {
        for (raw_id, raw_sha) in signatures {
            let Ok(id) = raw_id.parse::<u64>() else {
                warnings.push(format!("legacy signature {:?}: bad comment id, dropped", raw_id));
                continue;
            };
            let sha = raw_sha.as_str().unwrap_or_default();
            let ts = cache
                .commits
                .get(sha)
                .map(|c| c.ts)
                .or_else(|| time::from_epoch(0));
            let Some(ts) = ts else { continue };
            let mut entry = CommentEntry::new(ts, "", CommentKind::Legacy);
            if !sha.is_empty() {
                entry.arg = Some(sha.to_string());
            }
            cache.comments.insert(id, entry);
        }
    }

    cache.head = obj
        .get("last_seen_sha")
        .or_else(|| obj.get("head"))
        .and_then(Value::as_str)
        .map(str::to_string);
    cache
}
