//! Current arm pose behind a mutex.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::errors::RoarmError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Gripper rotation in radians.
    pub t: f64,
}

impl Pose {
    pub const STARTUP: Pose = Pose { x: 235.0, y: 0.0, z: 234.0, t: 3.14 };

    pub fn new(x: f64, y: f64, z: f64, t: f64) -> Self {
        Self { x, y, z, t }
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::T => self.t,
        }
    }

    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::T => self.t = value,
        }
    }

    /// Largest absolute change over the linear axes. Rotation is ignored.
    pub fn max_axis_delta(&self, other: &Pose) -> f64 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Pose::STARTUP
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X: {:.2}  Y: {:.2}  Z: {:.2}  T: {:.2}", self.x, self.y, self.z, self.t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    T,
}

impl FromStr for Axis {
    type Err = RoarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            "t" => Ok(Axis::T),
            other => Err(RoarmError::Validation(format!("unknown axis '{}'", other))),
        }
    }
}

/// Shared pose of one robot. Clones share the same guard.
///
/// Every read-modify-write goes through [`PoseStore::update`], which holds the
/// lock only for the duration of the closure. Callers must not do I/O or sleep
/// inside the closure.
#[derive(Debug, Clone)]
pub struct PoseStore {
    inner: Arc<Mutex<Pose>>,
}

impl PoseStore {
    pub fn new(initial: Pose) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pose> {
        // A panicking holder cannot leave a half-written Pose behind (the
        // closure works on a whole value), so the last value is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read(&self) -> Pose {
        *self.lock()
    }

    /// Apply `mutator` atomically and return the resulting pose.
    pub fn update<F>(&self, mutator: F) -> Pose
    where
        F: FnOnce(&mut Pose),
    {
        let mut guard = self.lock();
        let mut next = *guard;
        mutator(&mut next);
        *guard = next;
        next
    }

    /// Like [`update`](Self::update) but also returns a value computed under the guard.
    pub fn update_with<F, R>(&self, mutator: F) -> (Pose, R)
    where
        F: FnOnce(&mut Pose) -> R,
    {
        let mut guard = self.lock();
        let mut next = *guard;
        let out = mutator(&mut next);
        *guard = next;
        (next, out)
    }

    pub fn reset(&self, startup: Pose) -> Pose {
        self.update(|p| *p = startup)
    }
}

impl Default for PoseStore {
    fn default() -> Self {
        Self::new(Pose::STARTUP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn update_returns_new_pose() {
        let store = PoseStore::default();
        let after = store.update(|p| p.x += 10.0);
        assert_eq!(after.x, 245.0);
        assert_eq!(store.read(), after);
        assert_eq!(store.reset(Pose::STARTUP), Pose::STARTUP);
    }

    #[test]
    fn max_axis_delta_ignores_rotation() {
        let a = Pose::new(0.0, 0.0, 0.0, 0.0);
        let b = Pose::new(3.0, -7.0, 5.0, 100.0);
        assert_eq!(a.max_axis_delta(&b), 7.0);
    }

    #[test]
    fn axis_parse() {
        assert_eq!("X".parse::<Axis>().unwrap(), Axis::X);
        assert_eq!(" t ".parse::<Axis>().unwrap(), Axis::T);
        assert!("w".parse::<Axis>().is_err());
    }

    // Writers stamp all four axes with one generation number; a reader must
    // never see two different generations in the same snapshot.
    #[test]
    fn no_torn_updates_under_contention() {
        let store = PoseStore::new(Pose::new(0.0, 0.0, 0.0, 0.0));
        let jog = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let g = (i * 2) as f64;
                    store.update(|p| {
                        p.x = g;
                        p.y = g;
                        p.z = g;
                        p.t = g;
                    });
                }
            })
        };
        let commit = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let g = (i * 2 + 1) as f64;
                    store.update(|p| *p = Pose::new(g, g, g, g));
                }
            })
        };
        let reader = {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    let p = store.read();
                    assert!(p.x == p.y && p.y == p.z && p.z == p.t, "torn pose {:?}", p);
                }
            })
        };
        jog.join().unwrap();
        commit.join().unwrap();
        reader.join().unwrap();
        let p = store.read();
        assert!(p.x == p.y && p.y == p.z && p.z == p.t);
    }
}
