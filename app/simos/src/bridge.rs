// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The one-lane bridge.
//!
//! Cars cross in one direction at a time, at most `MAX_CARS` at once. A car
//! arriving in the other direction, or at a full bridge, waits. Waiting is
//! done Mesa style, so arrivals re-check in a loop.

use std::fmt;
use std::sync::Arc;

use simkern::cell::KernelCell;
use simkern::{Condition, Kernel, Lock};

const MAX_CARS: usize = 3;
const TRIPS: usize = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Direction {
    East,
    West,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::East => "east",
            Direction::West => "west",
        })
    }
}

struct Traffic {
    on_bridge: usize,
    direction: Direction,
}

struct Bridge {
    lock: Lock,
    changed: Condition,
    traffic: KernelCell<Traffic>,
}

impl Bridge {
    fn new(k: &Kernel) -> Self {
        Self {
            lock: Lock::new(k, "bridge"),
            changed: Condition::new(k, "bridge changed"),
            traffic: KernelCell::new(Traffic {
                on_bridge: 0,
                direction: Direction::East,
            }),
        }
    }

    fn must_wait(&self, dir: Direction) -> bool {
        self.traffic.with(|t| {
            t.on_bridge > 0 && (t.on_bridge >= MAX_CARS || t.direction != dir)
        })
    }

    /// Returns once the car has a place on the bridge.
    fn arrive(&self, dir: Direction) {
        self.lock.acquire();
        while self.must_wait(dir) {
            self.changed.wait(&self.lock);
        }
        self.traffic.with(|t| {
            t.on_bridge += 1;
            t.direction = dir;
            assert!(t.on_bridge <= MAX_CARS, "bridge collapsed");
        });
        self.lock.release();
    }

    fn exit(&self) {
        self.lock.acquire();
        self.traffic.with(|t| t.on_bridge -= 1);
        self.changed.broadcast(&self.lock);
        self.lock.release();
    }
}

pub fn traffic(k: &Kernel, cars: usize) {
    let bridge = Arc::new(Bridge::new(k));
    for car in 0..cars {
        let bridge = Arc::clone(&bridge);
        k.spawn(&format!("car {car}"), move |k| {
            for trip in 0..TRIPS {
                let dir = if trip % 2 == 0 {
                    Direction::East
                } else {
                    Direction::West
                };
                println!("car {car} arriving, heading {dir}");
                bridge.arrive(dir);
                k.yield_now();
                println!("car {car} crossing, heading {dir}");
                k.yield_now();
                println!("car {car} exiting, heading {dir}");
                bridge.exit();
                k.yield_now();
            }
        });
    }
}
