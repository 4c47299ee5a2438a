//! Operation semantics shared by every backend.
//!
//! A backend only has to expose its records through [`RecordMap`]; TTLs,
//! counters, sorted sets, capped lists and geo sets are all interpreted here.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Reply, StoreError, StoreOp, StoreResult};
use crate::geo::Location;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub data: RecordData,
    /// Epoch millis after which the record is gone.
    pub expires_at: Option<i64>,
}

impl Record {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordData {
    Text(String),
    Counter(i64),
    SortedSet(HashMap<String, f64>),
    Geo(HashMap<String, Location>),
    List(Vec<String>),
}

pub trait RecordMap {
    fn load(&mut self, key: &str) -> StoreResult<Option<Record>>;
    fn save(&mut self, key: &str, record: Record) -> StoreResult<()>;
    fn remove(&mut self, key: &str) -> StoreResult<bool>;
    fn keys_with_prefix(&mut self, prefix: &str) -> StoreResult<Vec<String>>;
}

impl RecordMap for HashMap<String, Record> {
    fn load(&mut self, key: &str) -> StoreResult<Option<Record>> {
        Ok(self.get(key).cloned())
    }

    fn save(&mut self, key: &str, record: Record) -> StoreResult<()> {
        self.insert(key.to_string(), record);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<bool> {
        Ok(HashMap::remove(self, key).is_some())
    }

    fn keys_with_prefix(&mut self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

fn deadline(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Load a record, dropping it if its deadline has passed.
fn live(map: &mut impl RecordMap, key: &str, now: i64) -> StoreResult<Option<Record>> {
    match map.load(key)? {
        Some(record) if record.is_expired(now) => {
            map.remove(key)?;
            Ok(None)
        }
        other => Ok(other),
    }
}

fn sorted_set(
    map: &mut impl RecordMap,
    key: &str,
    now: i64,
) -> StoreResult<Option<(HashMap<String, f64>, Option<i64>)>> {
    match live(map, key, now)? {
        None => Ok(None),
        Some(Record {
            data: RecordData::SortedSet(members),
            expires_at,
        }) => Ok(Some((members, expires_at))),
        Some(_) => Err(StoreError::WrongType(key.to_string())),
    }
}

fn geo_set(
    map: &mut impl RecordMap,
    key: &str,
    now: i64,
) -> StoreResult<Option<(HashMap<String, Location>, Option<i64>)>> {
    match live(map, key, now)? {
        None => Ok(None),
        Some(Record {
            data: RecordData::Geo(members),
            expires_at,
        }) => Ok(Some((members, expires_at))),
        Some(_) => Err(StoreError::WrongType(key.to_string())),
    }
}

fn list(map: &mut impl RecordMap, key: &str, now: i64) -> StoreResult<Vec<String>> {
    match live(map, key, now)? {
        None => Ok(Vec::new()),
        Some(Record {
            data: RecordData::List(items),
            ..
        }) => Ok(items),
        Some(_) => Err(StoreError::WrongType(key.to_string())),
    }
}

/// Write a collection back, or drop the key once it is empty.
fn save_or_remove(
    map: &mut impl RecordMap,
    key: &str,
    record: Record,
    empty: bool,
) -> StoreResult<()> {
    if empty {
        map.remove(key)?;
        Ok(())
    } else {
        map.save(key, record)
    }
}

fn ascending(mut items: Vec<(String, f64)>) -> Vec<(String, f64)> {
    items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    items
}

#[allow(clippy::too_many_lines)]
pub fn apply(map: &mut impl RecordMap, op: StoreOp, now: i64) -> StoreResult<Reply> {
    match op {
        StoreOp::Put { key, value, ttl } => {
            map.save(
                &key,
                Record {
                    data: RecordData::Text(value),
                    expires_at: ttl.map(|ttl| deadline(now, ttl)),
                },
            )?;
            Ok(Reply::Unit)
        }

        StoreOp::Get { key } => match live(map, &key, now)? {
            None => Ok(Reply::Value(None)),
            Some(Record {
                data: RecordData::Text(value),
                ..
            }) => Ok(Reply::Value(Some(value))),
            Some(Record {
                data: RecordData::Counter(n),
                ..
            }) => Ok(Reply::Value(Some(n.to_string()))),
            Some(_) => Err(StoreError::WrongType(key)),
        },

        StoreOp::Delete { key } => {
            let existed = live(map, &key, now)?.is_some();
            if existed {
                map.remove(&key)?;
            }
            Ok(Reply::Flag(existed))
        }

        StoreOp::DeletePrefix { prefix } => {
            let mut removed = 0;
            for key in map.keys_with_prefix(&prefix)? {
                if live(map, &key, now)?.is_some() {
                    map.remove(&key)?;
                    removed += 1;
                }
            }
            Ok(Reply::Count(removed))
        }

        StoreOp::CountPrefix { prefix } => {
            let mut count = 0;
            for key in map.keys_with_prefix(&prefix)? {
                if live(map, &key, now)?.is_some() {
                    count += 1;
                }
            }
            Ok(Reply::Count(count))
        }

        StoreOp::ValuesWithPrefix { prefix } => {
            let mut values = Vec::new();
            for key in map.keys_with_prefix(&prefix)? {
                if let Some(Record {
                    data: RecordData::Text(value),
                    ..
                }) = live(map, &key, now)?
                {
                    values.push(value);
                }
            }
            Ok(Reply::Items(values))
        }

        StoreOp::Expire { key, ttl } => match live(map, &key, now)? {
            Some(mut record) => {
                record.expires_at = Some(deadline(now, ttl));
                map.save(&key, record)?;
                Ok(Reply::Flag(true))
            }
            None => Ok(Reply::Flag(false)),
        },

        StoreOp::Increment { key, ttl_on_create } => match live(map, &key, now)? {
            None => {
                map.save(
                    &key,
                    Record {
                        data: RecordData::Counter(1),
                        expires_at: Some(deadline(now, ttl_on_create)),
                    },
                )?;
                Ok(Reply::Int(1))
            }
            Some(Record {
                data: RecordData::Counter(n),
                expires_at,
            }) => {
                let next = n.saturating_add(1);
                map.save(
                    &key,
                    Record {
                        data: RecordData::Counter(next),
                        expires_at,
                    },
                )?;
                Ok(Reply::Int(next))
            }
            Some(_) => Err(StoreError::WrongType(key)),
        },

        StoreOp::AddToSortedSet { set, member, score } => {
            let (mut members, expires_at) = sorted_set(map, &set, now)?.unwrap_or_default();
            members.insert(member, score);
            map.save(
                &set,
                Record {
                    data: RecordData::SortedSet(members),
                    expires_at,
                },
            )?;
            Ok(Reply::Unit)
        }

        StoreOp::SortedSetScore { set, member } => Ok(Reply::Score(
            sorted_set(map, &set, now)?.and_then(|(members, _)| members.get(&member).copied()),
        )),

        StoreOp::SortedSetRange { set } => {
            let members = sorted_set(map, &set, now)?
                .map(|(members, _)| members.into_iter().collect())
                .unwrap_or_default();
            Ok(Reply::Scored(ascending(members)))
        }

        StoreOp::CountInScoreRange { set, lo, hi } => {
            let count = sorted_set(map, &set, now)?.map_or(0, |(members, _)| {
                members
                    .values()
                    .filter(|score| (lo..=hi).contains(*score))
                    .count()
            });
            Ok(Reply::Count(count))
        }

        StoreOp::RemoveFromSortedSet { set, member } => {
            let Some((mut members, expires_at)) = sorted_set(map, &set, now)? else {
                return Ok(Reply::Flag(false));
            };
            let removed = members.remove(&member).is_some();
            if removed {
                let empty = members.is_empty();
                let record = Record {
                    data: RecordData::SortedSet(members),
                    expires_at,
                };
                save_or_remove(map, &set, record, empty)?;
            }
            Ok(Reply::Flag(removed))
        }

        StoreOp::RemoveScoreRange { set, lo, hi } => {
            let Some((mut members, expires_at)) = sorted_set(map, &set, now)? else {
                return Ok(Reply::Count(0));
            };
            let before = members.len();
            members.retain(|_, score| !(lo..=hi).contains(&*score));
            let removed = before - members.len();
            if removed > 0 {
                let empty = members.is_empty();
                let record = Record {
                    data: RecordData::SortedSet(members),
                    expires_at,
                };
                save_or_remove(map, &set, record, empty)?;
            }
            Ok(Reply::Count(removed))
        }

        StoreOp::PushCapped {
            key,
            value,
            max_len,
            ttl,
        } => {
            let mut items = list(map, &key, now)?;
            items.insert(0, value);
            items.truncate(max_len);
            map.save(
                &key,
                Record {
                    data: RecordData::List(items),
                    expires_at: Some(deadline(now, ttl)),
                },
            )?;
            Ok(Reply::Unit)
        }

        StoreOp::List { key } => Ok(Reply::Items(list(map, &key, now)?)),

        StoreOp::GeoIndex {
            set,
            member,
            location,
        } => {
            let (mut members, expires_at) = geo_set(map, &set, now)?.unwrap_or_default();
            members.insert(member, location);
            map.save(
                &set,
                Record {
                    data: RecordData::Geo(members),
                    expires_at,
                },
            )?;
            Ok(Reply::Unit)
        }

        StoreOp::GeoQuery {
            set,
            center,
            radius_m,
        } => {
            let hits = geo_set(map, &set, now)?
                .map(|(members, _)| {
                    members
                        .into_iter()
                        .map(|(member, location)| {
                            let distance = center.distance_to(&location);
                            (member, distance)
                        })
                        .filter(|(_, distance)| *distance <= radius_m)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Reply::Scored(ascending(hits)))
        }

        StoreOp::GeoRemove { set, member } => {
            let Some((mut members, expires_at)) = geo_set(map, &set, now)? else {
                return Ok(Reply::Flag(false));
            };
            let removed = members.remove(&member).is_some();
            if removed {
                let empty = members.is_empty();
                let record = Record {
                    data: RecordData::Geo(members),
                    expires_at,
                };
                save_or_remove(map, &set, record, empty)?;
            }
            Ok(Reply::Flag(removed))
        }

        StoreOp::SweepExpired => {
            let mut swept = 0;
            for key in map.keys_with_prefix("")? {
                if let Some(record) = map.load(&key)? {
                    if record.is_expired(now) {
                        map.remove(&key)?;
                        swept += 1;
                    }
                }
            }
            Ok(Reply::Count(swept))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn run(map: &mut HashMap<String, Record>, op: StoreOp, now: i64) -> Reply {
        apply(map, op, now).unwrap()
    }

    #[test]
    fn put_with_ttl_expires() {
        let mut map = HashMap::new();
        run(
            &mut map,
            StoreOp::Put {
                key: "a".into(),
                value: "1".into(),
                ttl: Some(Duration::from_secs(10)),
            },
            T0,
        );
        let get = || StoreOp::Get { key: "a".into() };
        assert_eq!(run(&mut map, get(), T0 + 9_999), Reply::Value(Some("1".into())));
        assert_eq!(run(&mut map, get(), T0 + 10_000), Reply::Value(None));
        assert!(map.is_empty());
    }

    #[test]
    fn increment_window_resets_after_ttl() {
        let mut map = HashMap::new();
        let incr = || StoreOp::Increment {
            key: "rate".into(),
            ttl_on_create: Duration::from_secs(60),
        };
        assert_eq!(run(&mut map, incr(), T0), Reply::Int(1));
        assert_eq!(run(&mut map, incr(), T0 + 30_000), Reply::Int(2));
        // deadline is fixed at creation, not pushed out by later increments
        assert_eq!(run(&mut map, incr(), T0 + 60_000), Reply::Int(1));
    }

    #[test]
    fn sorted_set_range_and_counts() {
        let mut map = HashMap::new();
        for (member, score) in [("b", 2.0), ("a", 1.0), ("c", 3.0)] {
            run(
                &mut map,
                StoreOp::AddToSortedSet {
                    set: "z".into(),
                    member: member.into(),
                    score,
                },
                T0,
            );
        }
        assert_eq!(
            run(&mut map, StoreOp::SortedSetRange { set: "z".into() }, T0),
            Reply::Scored(vec![("a".into(), 1.0), ("b".into(), 2.0), ("c".into(), 3.0)])
        );
        assert_eq!(
            run(
                &mut map,
                StoreOp::CountInScoreRange {
                    set: "z".into(),
                    lo: 2.0,
                    hi: f64::INFINITY
                },
                T0
            ),
            Reply::Count(2)
        );
        assert_eq!(
            run(
                &mut map,
                StoreOp::RemoveScoreRange {
                    set: "z".into(),
                    lo: f64::NEG_INFINITY,
                    hi: 2.0
                },
                T0
            ),
            Reply::Count(2)
        );
        assert_eq!(
            run(
                &mut map,
                StoreOp::RemoveFromSortedSet {
                    set: "z".into(),
                    member: "c".into()
                },
                T0
            ),
            Reply::Flag(true)
        );
        assert!(map.is_empty(), "empty sets are dropped");
    }

    #[test]
    fn geo_query_sorted_by_distance_within_radius() {
        let mut map = HashMap::new();
        let points = [
            ("far", Location::new(40.02, -74.0)),
            ("near", Location::new(40.0005, -74.0)),
            ("mid", Location::new(40.005, -74.0)),
        ];
        for (member, location) in points {
            run(
                &mut map,
                StoreOp::GeoIndex {
                    set: "g".into(),
                    member: member.into(),
                    location,
                },
                T0,
            );
        }
        let Reply::Scored(hits) = run(
            &mut map,
            StoreOp::GeoQuery {
                set: "g".into(),
                center: Location::new(40.0, -74.0),
                radius_m: 1000.0,
            },
            T0,
        ) else {
            panic!("expected scored reply");
        };
        let names: Vec<_> = hits.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, vec!["near", "mid"]);
        assert!(hits[0].1 < hits[1].1);
    }

    #[test]
    fn push_capped_keeps_newest_first() {
        let mut map = HashMap::new();
        for i in 0..12 {
            run(
                &mut map,
                StoreOp::PushCapped {
                    key: "l".into(),
                    value: i.to_string(),
                    max_len: 10,
                    ttl: Duration::from_secs(60),
                },
                T0,
            );
        }
        let Reply::Items(items) = run(&mut map, StoreOp::List { key: "l".into() }, T0) else {
            panic!("expected items");
        };
        assert_eq!(items.len(), 10);
        assert_eq!(items[0], "11");
        assert_eq!(items[9], "2");
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut map = HashMap::new();
        run(
            &mut map,
            StoreOp::Put {
                key: "short".into(),
                value: "x".into(),
                ttl: Some(Duration::from_secs(1)),
            },
            T0,
        );
        run(
            &mut map,
            StoreOp::Put {
                key: "forever".into(),
                value: "y".into(),
                ttl: None,
            },
            T0,
        );
        assert_eq!(run(&mut map, StoreOp::SweepExpired, T0 + 5_000), Reply::Count(1));
        assert!(map.contains_key("forever"));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut map = HashMap::new();
        run(
            &mut map,
            StoreOp::Put {
                key: "k".into(),
                value: "v".into(),
                ttl: None,
            },
            T0,
        );
        let err = apply(
            &mut map,
            StoreOp::AddToSortedSet {
                set: "k".into(),
                member: "m".into(),
                score: 1.0,
            },
            T0,
        );
        assert!(matches!(err, Err(StoreError::WrongType(_))));
    }

    #[test]
    fn prefix_operations_skip_expired_keys() {
        let mut map = HashMap::new();
        for (key, ttl) in [("abuse:a", None), ("abuse:b", Some(Duration::from_secs(1))), ("other", None)] {
            run(
                &mut map,
                StoreOp::Put {
                    key: key.into(),
                    value: "1".into(),
                    ttl,
                },
                T0,
            );
        }
        assert_eq!(
            run(&mut map, StoreOp::CountPrefix { prefix: "abuse:".into() }, T0 + 2_000),
            Reply::Count(1)
        );
        assert_eq!(
            run(&mut map, StoreOp::ValuesWithPrefix { prefix: "abuse:".into() }, T0 + 2_000),
            Reply::Items(vec!["1".into()])
        );
        assert_eq!(
            run(&mut map, StoreOp::DeletePrefix { prefix: "abuse:".into() }, T0 + 2_000),
            Reply::Count(1)
        );
        assert_eq!(map.len(), 1);
    }
}
