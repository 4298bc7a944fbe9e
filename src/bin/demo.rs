/*
 * Created on Mon Jan 13 2025
 *
 * This file is a part of sfsd, a deadlock-free shared-file coordination
 * service implementing the Resource-Allocation-Graph avoidance algorithm.
 *
 * Copyright (c) 2025, the sfsd authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Forks three children that all `declare` two overlapping files, then
//! `acquire` them in opposite orders so that, without deadlock avoidance,
//! two of them would wait on each other forever. Demonstrates that the
//! coordinator instead serialises them safely.

use sfsd::{Config, Coordinator};
use std::time::Duration;

fn child_body(label: &str, first: &str, second: &str) -> i32 {
    let cfg = Config::from_env();
    sfsd::config::init_logging(&cfg);
    let mut c = match Coordinator::init(&cfg) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[{label}] init failed: {e}");
            return 1;
        }
    };

    if let Err(e) = c.declare(&[first, second]) {
        eprintln!("[{label}] declare failed: {e}");
        return 1;
    }

    println!("[{label}] acquiring {first}");
    let h1 = match c.acquire(first, "r+") {
        Ok(h) => h,
        Err(e) => {
            eprintln!("[{label}] acquire {first} failed: {e}");
            return 1;
        }
    };
    std::thread::sleep(Duration::from_millis(50));

    println!("[{label}] acquiring {second}");
    let h2 = match c.acquire(second, "r+") {
        Ok(h) => h,
        Err(e) => {
            eprintln!("[{label}] acquire {second} failed: {e}");
            return 1;
        }
    };

    println!("[{label}] holds both, releasing");
    let _ = c.release(h1);
    let _ = c.release(h2);
    let _ = c.leave();
    0
}

#[cfg(unix)]
fn main() {
    let cfg = Config::from_env();
    sfsd::config::init_logging(&cfg);

    let dir = std::env::temp_dir().join(format!("sfsd-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create demo scratch dir");
    let a = dir.join("a.txt");
    let b = dir.join("b.txt");
    std::fs::write(&a, b"a").unwrap();
    std::fs::write(&b, b"b").unwrap();
    let a = a.to_str().unwrap().to_owned();
    let b = b.to_str().unwrap().to_owned();

    // bootstrap the region before forking so every child attaches to an
    // already-initialised one
    Coordinator::init(&cfg).expect("bootstrap region").detach().ok();

    let plans: [(&str, String, String); 3] = [
        ("p1", a.clone(), b.clone()),
        ("p2", b.clone(), a.clone()),
        ("p3", a.clone(), b.clone()),
    ];

    let mut child_pids = Vec::new();
    for (label, first, second) in plans {
        match unsafe { libc::fork() } {
            -1 => panic!("fork failed"),
            0 => {
                let code = child_body(label, &first, &second);
                std::process::exit(code);
            }
            pid => child_pids.push(pid),
        }
    }

    for pid in child_pids {
        let mut status = 0i32;
        unsafe {
            libc::waitpid(pid, &mut status as *mut i32, 0);
        }
    }

    let mut c = Coordinator::init(&cfg).expect("reattach to destroy");
    c.destroy().expect("destroy region");
    std::fs::remove_dir_all(&dir).ok();
    println!("all participants finished without deadlock");
}

#[cfg(not(unix))]
fn main() {
    eprintln!("this demo uses fork() and only runs on unix");
}
