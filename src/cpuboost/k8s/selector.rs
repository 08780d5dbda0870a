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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cpuboost::util::error::{new_error, BoxError};

pub const SELECTOR_OP_IN: &str = "In";
pub const SELECTOR_OP_NOT_IN: &str = "NotIn";
pub const SELECTOR_OP_EXISTS: &str = "Exists";
pub const SELECTOR_OP_DOES_NOT_EXIST: &str = "DoesNotExist";

/// Declarative label selector as found on the StartupCPUBoost object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels", default, skip_serializing_if = "HashMap::is_empty")]
    pub match_labels: HashMap<String, String>,
    #[serde(
        rename = "matchExpressions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelector {
    /// Compiles the declarative form into an evaluatable `Selector`.
    /// Unknown operators and malformed value lists fail compilation.
    pub fn compile(&self) -> Result<Selector, BoxError> {
        let mut requirements = Vec::with_capacity(
            self.match_labels.len() + self.match_expressions.len(),
        );
        let mut keys: Vec<&String> = self.match_labels.keys().collect();
        keys.sort();
        for key in keys {
            requirements.push(LabelRequirement {
                key: key.clone(),
                operator: LabelOperator::Equals(self.match_labels[key].clone()),
            });
        }
        for expr in &self.match_expressions {
            let operator = match expr.operator.as_str() {
                SELECTOR_OP_IN => {
                    if expr.values.is_empty() {
                        return Err(new_error(format!(
                            "selector requirement {} with In operator needs values",
                            expr.key
                        )));
                    }
                    LabelOperator::In(expr.values.clone())
                }
                SELECTOR_OP_NOT_IN => {
                    if expr.values.is_empty() {
                        return Err(new_error(format!(
                            "selector requirement {} with NotIn operator needs values",
                            expr.key
                        )));
                    }
                    LabelOperator::NotIn(expr.values.clone())
                }
                SELECTOR_OP_EXISTS => {
                    if !expr.values.is_empty() {
                        return Err(new_error(format!(
                            "selector requirement {} with Exists operator takes no values",
                            expr.key
                        )));
                    }
                    LabelOperator::Exists
                }
                SELECTOR_OP_DOES_NOT_EXIST => {
                    if !expr.values.is_empty() {
                        return Err(new_error(format!(
                            "selector requirement {} with DoesNotExist operator takes no values",
                            expr.key
                        )));
                    }
                    LabelOperator::NotExists
                }
                other => {
                    return Err(new_error(format!(
                        "selector requirement {} has unknown operator {}",
                        expr.key, other
                    )))
                }
            };
            requirements.push(LabelRequirement {
                key: expr.key.clone(),
                operator,
            });
        }
        Ok(Selector { requirements })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum LabelOperator {
    Equals(String),
    In(Vec<String>),
    NotIn(Vec<String>),
    Exists,
    NotExists,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct LabelRequirement {
    key: String,
    operator: LabelOperator,
}

impl LabelRequirement {
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let actual = labels.get(&self.key);
        match &self.operator {
            LabelOperator::Equals(expected) => actual == Some(expected),
            LabelOperator::In(allowed) => actual
                .map(|value| allowed.iter().any(|candidate| candidate == value))
                .unwrap_or(false),
            LabelOperator::NotIn(disallowed) => actual
                .map(|value| !disallowed.iter().any(|candidate| candidate == value))
                .unwrap_or(true),
            LabelOperator::Exists => actual.is_some(),
            LabelOperator::NotExists => actual.is_none(),
        }
    }
}

/// Compiled selector: the conjunction of its requirements.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Selector {
    requirements: Vec<LabelRequirement>,
}

impl Selector {
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }

    /// Number of requirements; used to rank overlapping selectors by
    /// specificity.
    pub fn requirement_count(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}
