/*
 * Copyright (C) 2025 The Cpuboost Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use cpuboost::cpuboost::boost::duration::TimeSource;
use cpuboost::cpuboost::k8s::pod::Pod;

/// Clock whose reading the test advances explicitly.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        TestClock {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn time_source(&self) -> TimeSource {
        let now = self.now.clone();
        Arc::new(move || *now.lock().unwrap())
    }
}

/// Applies the mutator's RFC 6902 operations to a pod document. Only the
/// shapes the mutator emits (replace/add with absolute paths) are handled.
pub fn apply_admission_patch(pod: &Pod, ops: &[Value]) -> Pod {
    let mut document = serde_json::to_value(pod).expect("pod serializes");
    for op in ops {
        let path = op["path"].as_str().expect("op path");
        let value = op["value"].clone();
        let mut cursor = &mut document;
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            if i == segments.len() - 1 {
                cursor[*segment] = value.clone();
            } else {
                if cursor.get(*segment).is_none() {
                    cursor[*segment] = Value::Object(Default::default());
                }
                cursor = &mut cursor[*segment];
            }
        }
    }
    serde_json::from_value(document).expect("patched pod decodes")
}
