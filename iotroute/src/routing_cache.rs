//! Authorization and subscription state used on the routing hot path.
//!
//! Sensors, accounts and API keys are kept in three maps behind one
//! reader/writer lock. Lookups take the read lock; every mutation takes the
//! write lock, and no method calls another lock-taking method while holding it.
//!
//! Live data subscriptions are soft leases. The cache keeps two sets:
//!
//! - the *current* subscriptions, which is what routing sees, and
//! - the *pending* subscriptions, collected from explicit subscribes and from
//!   the periodic sync reports of the live data handlers.
//!
//! [`RoutingCache::flush_live_data_routes`] promotes the pending set to current
//! and starts over with an empty pending set, so a subscription that nobody
//! re-reports within one flush interval disappears on its own.
//!
//! Sensors hold no routing state. The live data targets of a sensor are read
//! from the subscription map at lookup time, so replacing a sensor (bulk reload
//! or single upsert) never loses its subscriptions.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::Serialize;

use crate::types::{
    Account, AccountId, ApiKey, LiveDataHandler, LiveDataRoute, ResolvedSensor, RoutingTarget, Sensor,
    SensorId, Target,
};
use crate::utils::Counter;
use crate::{Error, Result};

#[derive(Default)]
struct State {
    sensors: AHashMap<SensorId, Arc<Sensor>>,
    accounts: AHashMap<AccountId, Account>,
    api_keys: AHashMap<String, ApiKey>,
    handlers: AHashMap<Target, LiveDataHandler>,
    current: AHashMap<SensorId, BTreeSet<Target>>,
    pending: AHashSet<LiveDataRoute>,
}

impl State {
    #[inline]
    fn handler_enabled(&self, target: &str) -> bool {
        self.handlers.get(target).is_some_and(|h| h.enabled)
    }

    fn targets_of(&self, id: &SensorId) -> Vec<RoutingTarget> {
        self.current
            .get(id)
            .map(|targets| targets.iter().map(RoutingTarget::live_data).collect())
            .unwrap_or_default()
    }

    fn authorize(&self, sensor: &Sensor) -> bool {
        let Some(account) = self.accounts.get(&sensor.account_id) else {
            log::warn!("unable to find account {} for sensor {}", sensor.account_id, sensor.id);
            return false;
        };
        let Some(key) = self.api_keys.get(&sensor.sensor_key) else {
            log::warn!("unable to find API key for sensor {}", sensor.id);
            return false;
        };
        is_authorized(account, key)
    }
}

/// The authorization rule for a sensor owned by `account` and authenticated by `key`
#[inline]
pub fn is_authorized(account: &Account, key: &ApiKey) -> bool {
    !account.has_billing_lockout
        && !account.is_banned
        && account.id == key.account_id
        && !key.is_read_only
        && !key.is_revoked
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RoutingCacheStats {
    pub sensors: Counter,
    pub accounts: Counter,
    pub api_keys: Counter,
    pub live_sensors: Counter,
}

#[derive(Clone)]
pub struct RoutingCache {
    inner: Arc<RoutingCacheInner>,
}

pub struct RoutingCacheInner {
    state: RwLock<State>,
    closed: AtomicBool,
    pub stats: RoutingCacheStats,
}

impl Deref for RoutingCache {
    type Target = RoutingCacheInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Default for RoutingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RoutingCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RoutingCache {{ sensors: {:?} }}", self.stats.sensors)
    }
}

impl RoutingCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RoutingCacheInner {
                state: RwLock::new(State::default()),
                closed: AtomicBool::new(false),
                stats: RoutingCacheStats::default(),
            }),
        }
    }

    #[inline]
    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Disposed("routing cache"))
        } else {
            Ok(())
        }
    }

    /// Write access, checked against `close` under the same lock
    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        let state = self.state.write();
        self.check_closed()?;
        Ok(state)
    }

    fn update_live_stats(&self, state: &State) {
        let live = state.current.keys().filter(|id| state.sensors.contains_key(id)).count();
        self.stats.live_sensors.sets(live as isize);
    }

    /// Replaces every sensor. Subscriptions survive, they are keyed by sensor id.
    pub fn load_sensors<I: IntoIterator<Item = Sensor>>(&self, sensors: I) -> Result<()> {
        self.check_closed()?;
        let fresh: AHashMap<SensorId, Arc<Sensor>> = sensors.into_iter().map(|s| (s.id, Arc::new(s))).collect();
        let count = fresh.len();
        let old = {
            let mut state = self.write()?;
            let old = std::mem::replace(&mut state.sensors, fresh);
            self.update_live_stats(&state);
            old
        };
        self.stats.sensors.sets(count as isize);
        drop(old);
        Ok(())
    }

    pub fn load_accounts<I: IntoIterator<Item = Account>>(&self, accounts: I) -> Result<()> {
        self.check_closed()?;
        let fresh: AHashMap<AccountId, Account> = accounts.into_iter().map(|a| (a.id, a)).collect();
        let count = fresh.len();
        let old = std::mem::replace(&mut self.write()?.accounts, fresh);
        self.stats.accounts.sets(count as isize);
        drop(old);
        Ok(())
    }

    pub fn load_api_keys<I: IntoIterator<Item = ApiKey>>(&self, keys: I) -> Result<()> {
        self.check_closed()?;
        let fresh: AHashMap<String, ApiKey> = keys.into_iter().map(|k| (k.key.clone(), k)).collect();
        let count = fresh.len();
        let old = std::mem::replace(&mut self.write()?.api_keys, fresh);
        self.stats.api_keys.sets(count as isize);
        drop(old);
        Ok(())
    }

    /// Looks up an authorized sensor. Unknown and unauthorized sensors both yield `None`.
    pub fn get(&self, id: &SensorId) -> Result<Option<ResolvedSensor>> {
        self.check_closed()?;
        let state = self.state.read();
        let Some(sensor) = state.sensors.get(id) else {
            return Ok(None);
        };
        if !state.authorize(sensor) {
            return Ok(None);
        }
        Ok(Some(ResolvedSensor::new(sensor.clone(), state.targets_of(id))))
    }

    /// Inserts or replaces a single sensor, `id` must match the sensor's own id
    pub fn insert(&self, id: SensorId, sensor: Sensor) -> Result<()> {
        self.check_closed()?;
        if id.is_empty() {
            return Err(Error::InvalidArgument("sensor id must not be empty".into()));
        }
        if id != sensor.id {
            return Err(Error::InvalidArgument(format!("sensor id mismatch, {} != {}", id, sensor.id)));
        }
        let mut state = self.write()?;
        if state.sensors.insert(id, Arc::new(sensor)).is_none() {
            self.stats.sensors.inc();
        }
        self.update_live_stats(&state);
        Ok(())
    }

    pub fn append_account(&self, account: Account) -> Result<()> {
        self.check_closed()?;
        if self.write()?.accounts.insert(account.id, account).is_none() {
            self.stats.accounts.inc();
        }
        Ok(())
    }

    pub fn append_api_key(&self, key: String, api_key: ApiKey) -> Result<()> {
        self.check_closed()?;
        if self.write()?.api_keys.insert(key, api_key).is_none() {
            self.stats.api_keys.inc();
        }
        Ok(())
    }

    pub fn remove_sensor(&self, id: &SensorId) -> Result<bool> {
        self.check_closed()?;
        let mut state = self.write()?;
        let removed = state.sensors.remove(id).is_some();
        if removed {
            self.stats.sensors.dec();
            self.update_live_stats(&state);
        }
        Ok(removed)
    }

    pub fn remove_account(&self, id: &AccountId) -> Result<bool> {
        self.check_closed()?;
        let removed = self.write()?.accounts.remove(id).is_some();
        if removed {
            self.stats.accounts.dec();
        }
        Ok(removed)
    }

    pub fn remove_api_key(&self, key: &str) -> Result<bool> {
        self.check_closed()?;
        let removed = self.write()?.api_keys.remove(key).is_some();
        if removed {
            self.stats.api_keys.dec();
        }
        Ok(removed)
    }

    /// Upserts live data handlers by name
    pub fn set_live_data_handlers<I: IntoIterator<Item = LiveDataHandler>>(&self, handlers: I) -> Result<()> {
        self.check_closed()?;
        let mut state = self.write()?;
        for handler in handlers {
            state.handlers.insert(handler.name.clone(), handler);
        }
        Ok(())
    }

    /// Subscribes immediately. Ignored unless the target is an enabled handler.
    pub fn add_live_data_route(&self, route: LiveDataRoute) -> Result<bool> {
        self.check_closed()?;
        let mut state = self.write()?;
        if !state.handler_enabled(&route.target) {
            log::debug!("ignoring live data route {} -> {}, handler is not enabled", route.sensor_id, route.target);
            return Ok(false);
        }
        state.current.entry(route.sensor_id).or_default().insert(route.target.clone());
        state.pending.insert(route);
        self.update_live_stats(&state);
        Ok(true)
    }

    /// Unsubscribes immediately from both the current and the pending set
    pub fn remove_live_data_route(&self, route: &LiveDataRoute) -> Result<bool> {
        self.check_closed()?;
        let mut state = self.write()?;
        let mut removed = state.pending.remove(route);
        if let Some(targets) = state.current.get_mut(&route.sensor_id) {
            removed |= targets.remove(&route.target);
            if targets.is_empty() {
                state.current.remove(&route.sensor_id);
            }
        }
        self.update_live_stats(&state);
        Ok(removed)
    }

    /// Records the subscriptions a handler reports as its own. They become
    /// effective at the next [`RoutingCache::flush_live_data_routes`].
    pub fn sync_live_data_routes<I: IntoIterator<Item = LiveDataRoute>>(&self, routes: I) -> Result<usize> {
        self.check_closed()?;
        let mut state = self.write()?;
        let accepted: Vec<LiveDataRoute> = routes.into_iter().filter(|r| state.handler_enabled(&r.target)).collect();
        let count = accepted.len();
        state.pending.extend(accepted);
        Ok(count)
    }

    /// Promotes the pending subscriptions to current and starts a new, empty pending set
    pub fn flush_live_data_routes(&self) -> Result<()> {
        self.check_closed()?;
        let old = {
            let mut state = self.write()?;
            let pending = std::mem::take(&mut state.pending);
            let mut current: AHashMap<SensorId, BTreeSet<Target>> = AHashMap::with_capacity(pending.len());
            for route in pending {
                current.entry(route.sensor_id).or_default().insert(route.target);
            }
            let old = std::mem::replace(&mut state.current, current);
            self.update_live_stats(&state);
            old
        };
        drop(old);
        Ok(())
    }

    /// Current live data targets of a sensor
    pub fn live_data_targets(&self, id: &SensorId) -> Result<Vec<RoutingTarget>> {
        self.check_closed()?;
        Ok(self.state.read().targets_of(id))
    }

    /// Ids of the loaded sensors that currently have at least one live data target
    pub fn live_sensors(&self) -> Result<Vec<SensorId>> {
        self.check_closed()?;
        let state = self.state.read();
        Ok(state.current.keys().filter(|id| state.sensors.contains_key(id)).copied().collect())
    }

    /// Memory relief: returns the slack of every map to the allocator
    pub fn flush(&self) -> Result<()> {
        self.check_closed()?;
        let mut state = self.write()?;
        state.sensors.shrink_to_fit();
        state.accounts.shrink_to_fit();
        state.api_keys.shrink_to_fit();
        state.current.shrink_to_fit();
        state.pending.shrink_to_fit();
        Ok(())
    }

    #[inline]
    pub fn sensor_count(&self) -> usize {
        self.state.read().sensors.len()
    }

    #[inline]
    pub fn account_count(&self) -> usize {
        self.state.read().accounts.len()
    }

    #[inline]
    pub fn api_key_count(&self) -> usize {
        self.state.read().api_keys.len()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops all state. Every later call fails with [`Error::Disposed`].
    pub fn close(&self) {
        let old = {
            let mut state = self.state.write();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *state)
        };
        drop(old);
        log::info!("routing cache closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    fn handlers(names: &[(&str, bool)]) -> Vec<LiveDataHandler> {
        names.iter().map(|(n, e)| LiveDataHandler { name: n.to_string(), enabled: *e }).collect()
    }

    fn targets(cache: &RoutingCache, id: &SensorId) -> Vec<String> {
        cache.live_data_targets(id).unwrap().into_iter().map(|t| t.target).collect()
    }

    #[test]
    fn authorization_rule() {
        for banned in [false, true] {
            for lockout in [false, true] {
                for same_account in [false, true] {
                    for read_only in [false, true] {
                        for revoked in [false, true] {
                            let (cache, sensor) = loaded_cache();
                            let mut account = account_of(&sensor);
                            account.is_banned = banned;
                            account.has_billing_lockout = lockout;
                            let mut key = key_of(&sensor);
                            if !same_account {
                                key.account_id = uuid::Uuid::new_v4();
                            }
                            key.is_read_only = read_only;
                            key.is_revoked = revoked;
                            cache.load_accounts(vec![account]).unwrap();
                            cache.load_api_keys(vec![key]).unwrap();

                            let expected = !banned && !lockout && same_account && !read_only && !revoked;
                            let found = cache.get(&sensor.id).unwrap();
                            assert_eq!(found.is_some(), expected);
                            if let Some(found) = found {
                                assert_eq!(*found.sensor, sensor);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn missing_account_or_key_is_not_found() {
        let (cache, sensor) = loaded_cache();
        cache.remove_api_key(&sensor.sensor_key).unwrap();
        assert!(cache.get(&sensor.id).unwrap().is_none());

        cache.append_api_key(sensor.sensor_key.clone(), key_of(&sensor)).unwrap();
        assert!(cache.get(&sensor.id).unwrap().is_some());

        assert!(cache.remove_account(&sensor.account_id).unwrap());
        assert!(cache.get(&sensor.id).unwrap().is_none());
        assert!(!cache.remove_account(&sensor.account_id).unwrap());

        cache.append_account(account_of(&sensor)).unwrap();
        assert!(cache.get(&sensor.id).unwrap().is_some());
        assert!(cache.get(&sensor_id(99)).unwrap().is_none());
    }

    #[test]
    fn insert_requires_matching_id() {
        let cache = RoutingCache::new();
        let sensor = test_sensor(1);
        assert!(matches!(cache.insert(sensor_id(2), sensor.clone()), Err(Error::InvalidArgument(_))));
        let mut empty = sensor.clone();
        empty.id = SensorId::default();
        assert!(matches!(cache.insert(SensorId::default(), empty), Err(Error::InvalidArgument(_))));
        cache.insert(sensor.id, sensor).unwrap();
        assert_eq!(cache.sensor_count(), 1);
    }

    #[test]
    fn bulk_load_replaces_wholesale() {
        let (cache, sensor) = loaded_cache();
        let other = test_sensor(2);
        cache.load_sensors(vec![other.clone()]).unwrap();
        assert_eq!(cache.sensor_count(), 1);
        assert!(cache.get(&sensor.id).unwrap().is_none());
        assert_eq!(cache.stats.sensors.count(), 1);

        cache.load_accounts(vec![account_of(&sensor), account_of(&other)]).unwrap();
        cache.load_api_keys(vec![key_of(&sensor), key_of(&other)]).unwrap();
        assert_eq!(cache.account_count(), 2);
        assert_eq!(cache.api_key_count(), 2);
        assert!(cache.get(&other.id).unwrap().is_some());
    }

    #[test]
    fn explicit_subscription_requires_enabled_handler() {
        let (cache, sensor) = loaded_cache();
        cache.set_live_data_handlers(handlers(&[("s1", true), ("s2", false)])).unwrap();

        assert!(!cache.add_live_data_route(LiveDataRoute::new(sensor.id, "s2")).unwrap());
        assert!(!cache.add_live_data_route(LiveDataRoute::new(sensor.id, "unknown")).unwrap());
        assert!(targets(&cache, &sensor.id).is_empty());

        assert!(cache.add_live_data_route(LiveDataRoute::new(sensor.id, "s1")).unwrap());
        assert_eq!(targets(&cache, &sensor.id), vec!["s1"]);
        let resolved = cache.get(&sensor.id).unwrap().unwrap();
        assert_eq!(resolved.live_data_routing, vec![RoutingTarget::live_data("s1")]);
        assert_eq!(cache.live_sensors().unwrap(), vec![sensor.id]);

        //a handler disabled later keeps its subscriptions until the next flush
        cache.set_live_data_handlers(handlers(&[("s1", false)])).unwrap();
        assert_eq!(targets(&cache, &sensor.id), vec!["s1"]);

        assert!(cache.remove_live_data_route(&LiveDataRoute::new(sensor.id, "s1")).unwrap());
        assert!(targets(&cache, &sensor.id).is_empty());
        assert!(cache.live_sensors().unwrap().is_empty());
    }

    #[test]
    fn lease_is_replaced_when_not_renewed() {
        let (cache, sensor) = loaded_cache();
        cache.set_live_data_handlers(handlers(&[("s1", true), ("s2", true)])).unwrap();

        cache.sync_live_data_routes(vec![LiveDataRoute::new(sensor.id, "s1")]).unwrap();
        //not effective before the flush
        assert!(targets(&cache, &sensor.id).is_empty());
        cache.flush_live_data_routes().unwrap();
        assert_eq!(targets(&cache, &sensor.id), vec!["s1"]);

        cache.sync_live_data_routes(vec![LiveDataRoute::new(sensor.id, "s2")]).unwrap();
        cache.flush_live_data_routes().unwrap();
        assert_eq!(targets(&cache, &sensor.id), vec!["s2"]);

        cache.flush_live_data_routes().unwrap();
        assert!(targets(&cache, &sensor.id).is_empty());
    }

    #[test]
    fn explicit_subscription_lives_one_flush_cycle() {
        let (cache, sensor) = loaded_cache();
        cache.set_live_data_handlers(handlers(&[("s1", true)])).unwrap();
        cache.add_live_data_route(LiveDataRoute::new(sensor.id, "s1")).unwrap();

        cache.flush_live_data_routes().unwrap();
        assert_eq!(targets(&cache, &sensor.id), vec!["s1"]);
        cache.flush_live_data_routes().unwrap();
        assert!(targets(&cache, &sensor.id).is_empty());
    }

    #[test]
    fn sync_skips_disabled_handlers() {
        let (cache, sensor) = loaded_cache();
        cache.set_live_data_handlers(handlers(&[("s1", true), ("s2", false)])).unwrap();
        let accepted = cache
            .sync_live_data_routes(vec![LiveDataRoute::new(sensor.id, "s1"), LiveDataRoute::new(sensor.id, "s2")])
            .unwrap();
        assert_eq!(accepted, 1);
        cache.flush_live_data_routes().unwrap();
        assert_eq!(targets(&cache, &sensor.id), vec!["s1"]);
    }

    #[test]
    fn subscriptions_survive_sensor_replacement() {
        let (cache, sensor) = loaded_cache();
        cache.set_live_data_handlers(handlers(&[("s1", true)])).unwrap();
        cache.add_live_data_route(LiveDataRoute::new(sensor.id, "s1")).unwrap();

        let mut replaced = sensor.clone();
        replaced.storage_enabled = false;
        cache.insert(sensor.id, replaced).unwrap();
        let resolved = cache.get(&sensor.id).unwrap().unwrap();
        assert!(!resolved.storage_enabled);
        assert!(resolved.has_live_data());

        cache.load_sensors(vec![sensor.clone()]).unwrap();
        assert!(cache.get(&sensor.id).unwrap().unwrap().has_live_data());

        //a removed sensor is no longer live
        cache.remove_sensor(&sensor.id).unwrap();
        assert!(cache.live_sensors().unwrap().is_empty());
        assert_eq!(cache.stats.live_sensors.count(), 0);
    }

    #[test]
    fn closed_cache_rejects_use() {
        let (cache, sensor) = loaded_cache();
        cache.flush().unwrap();
        cache.close();
        assert!(cache.is_closed());
        assert!(matches!(cache.get(&sensor.id), Err(Error::Disposed(_))));
        assert!(matches!(cache.load_sensors(vec![]), Err(Error::Disposed(_))));
        assert!(matches!(cache.flush_live_data_routes(), Err(Error::Disposed(_))));
        assert!(matches!(cache.flush(), Err(Error::Disposed(_))));
        assert_eq!(cache.sensor_count(), 0);
        cache.close();
    }

    #[test]
    fn close_racing_writers_leaves_nothing_behind() {
        for _ in 0..100 {
            let cache = RoutingCache::new();
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    for i in 0..50 {
                        let sensor = test_sensor(i);
                        if cache.insert(sensor.id, sensor).is_err() {
                            break;
                        }
                    }
                });
                barrier.wait();
                cache.close();
            });
            assert!(cache.state.read().sensors.is_empty());
        }
    }

    #[test]
    fn concurrent_readers_and_reloads() {
        let (cache, sensor) = loaded_cache();
        let account = account_of(&sensor);
        let key = key_of(&sensor);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        //a reader sees the old or the new snapshot, never a partial one
                        assert!(cache.get(&sensor.id).unwrap().is_some());
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    cache.load_sensors(vec![sensor.clone()]).unwrap();
                    cache.load_accounts(vec![account.clone()]).unwrap();
                    cache.load_api_keys(vec![key.clone()]).unwrap();
                }
            });
        });
    }
}
