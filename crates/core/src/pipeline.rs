//! Per-group accumulation across sessions, RDM construction and RSA.

use std::collections::HashMap;
use std::fmt;

use ndarray::{concatenate, Array2, ArrayBase, ArrayView2, Axis, Data, Ix2};
use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::config::AnalysisConfig;
use crate::engine::RdmEngine;
use crate::error::{RdmError, RdmResult};
use crate::rdm::Rdm;
use crate::rsa::{CompareMode, RsaMatrix};
use crate::store::{LazyRdm, RdmSource, RdmStore};

/// Opaque group identifier (e.g. an ROI name).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for GroupKey {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Mapping between numeric feature label codes and group names.
#[derive(Clone, Debug, Default)]
pub struct LabelMap {
    by_name: HashMap<String, u32>,
    by_code: HashMap<u32, String>,
}

impl LabelMap {
    /// Parse `"<code> <name>"` lines. Blank lines and lines without a name are ignored.
    pub fn parse(text: &str) -> RdmResult<Self> {
        let mut map = Self::default();
        for (idx, line) in text.lines().enumerate() {
            let mut parts = line.trim().splitn(2, char::is_whitespace);
            let (Some(code), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let code: u32 = code.parse().map_err(|_| {
                RdmError::InvalidConfig(format!(
                    "label line {}: '{}' is not a numeric code",
                    idx + 1,
                    code
                ))
            })?;
            map.insert(code, name.trim());
        }
        Ok(map)
    }

    pub fn insert(&mut self, code: u32, name: &str) {
        self.by_name.insert(name.to_string(), code);
        self.by_code.insert(code, name.to_string());
    }

    pub fn code_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, code: u32) -> Option<&str> {
        self.by_code.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl<'a> FromIterator<(u32, &'a str)> for LabelMap {
    fn from_iter<I: IntoIterator<Item = (u32, &'a str)>>(iter: I) -> Self {
        let mut map = Self::default();
        for (code, name) in iter {
            map.insert(code, name);
        }
        map
    }
}

/// Why a group produced no RDM, or contributed nothing for one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SkipReason {
    #[strum(to_string = "group label not found")]
    LabelNotFound,
    #[strum(to_string = "no features carry the group label")]
    NoFeatures,
    #[strum(to_string = "no rows accumulated")]
    NoRows,
}

/// Non-fatal condition reported alongside pipeline results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSkip {
    pub group: GroupKey,
    pub session: Option<usize>,
    pub reason: SkipReason,
}

impl fmt::Display for GroupSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session {
            Some(session) => write!(f, "{} (session {}): {}", self.group, session, self.reason),
            None => write!(f, "{}: {}", self.group, self.reason),
        }
    }
}

struct GroupSlot {
    key: GroupKey,
    code: u32,
    width: Option<usize>,
    blocks: Vec<Array2<f32>>,
}

/// Collects each group's rows across sessions.
///
/// Pass it to every session step, then call [`SessionAccumulator::finish`] once.
pub struct SessionAccumulator {
    slots: Vec<GroupSlot>,
    skipped: Vec<GroupSkip>,
    sessions: usize,
}

impl SessionAccumulator {
    /// Groups whose names are missing from `labels` are reported as skipped
    /// immediately and take no further part.
    pub fn new<I, K>(labels: &LabelMap, groups: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<GroupKey>,
    {
        let mut slots: Vec<GroupSlot> = Vec::new();
        let mut skipped = Vec::new();
        for key in groups.into_iter().map(Into::into) {
            if slots.iter().any(|s| s.key == key) || skipped.iter().any(|s: &GroupSkip| s.group == key) {
                continue;
            }
            match labels.code_of(key.as_str()) {
                Some(code) => slots.push(GroupSlot {
                    key,
                    code,
                    width: None,
                    blocks: Vec::new(),
                }),
                None => {
                    warn!(group = %key, "group label not found, skipping");
                    skipped.push(GroupSkip {
                        group: key,
                        session: None,
                        reason: SkipReason::LabelNotFound,
                    });
                }
            }
        }
        Self {
            slots,
            skipped,
            sessions: 0,
        }
    }

    /// Add one session's `samples x features` responses; `feature_labels[c]`
    /// is the label code of column `c`.
    pub fn add_session<S>(
        &mut self,
        session: usize,
        responses: &ArrayBase<S, Ix2>,
        feature_labels: &[u32],
    ) -> RdmResult<()>
    where
        S: Data<Elem = f32>,
    {
        let (n_rows, n_cols) = responses.dim();
        if feature_labels.len() != n_cols {
            return Err(RdmError::ShapeMismatch {
                context: "session feature labels",
                expected: (n_rows, n_cols),
                actual: (n_rows, feature_labels.len()),
            });
        }

        // Resolve and check every group before touching any slot, so a
        // rejected session leaves the accumulator unchanged.
        let mut selected = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let cols: Vec<usize> = feature_labels
                .iter()
                .enumerate()
                .filter(|(_, &code)| code == slot.code)
                .map(|(c, _)| c)
                .collect();
            if let Some(width) = slot.width {
                if !cols.is_empty() && width != cols.len() {
                    return Err(RdmError::ShapeMismatch {
                        context: "group feature count across sessions",
                        expected: (n_rows, width),
                        actual: (n_rows, cols.len()),
                    }
                    .in_group(slot.key.as_str()));
                }
            }
            selected.push(cols);
        }

        for (slot, cols) in self.slots.iter_mut().zip(selected) {
            if cols.is_empty() {
                warn!(group = %slot.key, session, "no features for group in session");
                self.skipped.push(GroupSkip {
                    group: slot.key.clone(),
                    session: Some(session),
                    reason: SkipReason::NoFeatures,
                });
                continue;
            }
            slot.width = Some(cols.len());
            slot.blocks.push(responses.select(Axis(1), &cols));
            debug!(group = %slot.key, session, rows = n_rows, features = cols.len(), "accumulated session");
        }

        self.sessions += 1;
        Ok(())
    }

    pub fn sessions(&self) -> usize {
        self.sessions
    }

    /// Concatenate each group's session blocks. Groups without rows are skipped.
    pub fn finish(self) -> RdmResult<AccumulatedGroups> {
        let mut groups = Vec::with_capacity(self.slots.len());
        let mut skipped = self.skipped;

        for slot in self.slots {
            let rows: usize = slot.blocks.iter().map(|b| b.nrows()).sum();
            if rows == 0 {
                warn!(group = %slot.key, "no data collected for group");
                skipped.push(GroupSkip {
                    group: slot.key,
                    session: None,
                    reason: SkipReason::NoRows,
                });
                continue;
            }
            let views: Vec<ArrayView2<'_, f32>> = slot.blocks.iter().map(|b| b.view()).collect();
            let matrix = concatenate(Axis(0), &views).map_err(|e| {
                RdmError::InvalidConfig(format!("cannot stack sessions: {e}")).in_group(slot.key.as_str())
            })?;
            info!(group = %slot.key, rows = matrix.nrows(), features = matrix.ncols(), "group matrix ready");
            groups.push((slot.key, matrix));
        }

        Ok(AccumulatedGroups { groups, skipped })
    }
}

/// One `samples x features` response matrix per group, in configured order.
#[derive(Debug, Default)]
pub struct AccumulatedGroups {
    groups: Vec<(GroupKey, Array2<f32>)>,
    skipped: Vec<GroupSkip>,
}

impl AccumulatedGroups {
    /// Use matrices supplied directly by a loader.
    pub fn from_matrices(groups: Vec<(GroupKey, Array2<f32>)>) -> Self {
        Self {
            groups,
            skipped: Vec::new(),
        }
    }

    pub fn groups(&self) -> &[(GroupKey, Array2<f32>)] {
        &self.groups
    }

    pub fn skipped(&self) -> &[GroupSkip] {
        &self.skipped
    }
}

/// An RDM held in memory or in a store.
#[derive(Clone, Debug)]
pub enum GroupRdm {
    Resident(Rdm),
    Stored(LazyRdm),
}

impl GroupRdm {
    pub fn load(&self) -> RdmResult<Rdm> {
        match self {
            GroupRdm::Resident(rdm) => Ok(rdm.clone()),
            GroupRdm::Stored(lazy) => lazy.load(),
        }
    }
}

impl RdmSource for GroupRdm {
    fn size(&self) -> usize {
        match self {
            GroupRdm::Resident(rdm) => rdm.size(),
            GroupRdm::Stored(lazy) => lazy.size(),
        }
    }

    fn upper_triangle(&self) -> RdmResult<Vec<f64>> {
        match self {
            GroupRdm::Resident(rdm) => Ok(rdm.upper_triangle()),
            GroupRdm::Stored(lazy) => lazy.upper_triangle(),
        }
    }

    fn principal_submatrix(&self, indices: &[usize]) -> RdmResult<Array2<f32>> {
        match self {
            GroupRdm::Resident(rdm) => rdm.select(indices),
            GroupRdm::Stored(lazy) => lazy.principal_submatrix(indices),
        }
    }
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub groups: Vec<GroupKey>,
    pub rdms: Vec<GroupRdm>,
    pub rsa: RsaMatrix,
    pub skipped: Vec<GroupSkip>,
}

impl PipelineOutput {
    pub fn rdm(&self, group: &str) -> Option<&GroupRdm> {
        self.groups
            .iter()
            .position(|g| g.as_str() == group)
            .map(|i| &self.rdms[i])
    }
}

/// RSA of a single session, for averaging across sessions.
#[derive(Debug)]
pub struct SessionRsa {
    pub session: usize,
    pub rsa: RsaMatrix,
    pub skipped: Vec<GroupSkip>,
}

pub struct Pipeline {
    config: AnalysisConfig,
    store: Option<RdmStore>,
}

impl Pipeline {
    pub fn new(config: AnalysisConfig) -> RdmResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: None,
        })
    }

    /// Persist every RDM under its group key and compare via lazy handles.
    pub fn with_store(mut self, store: RdmStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn run(&self, accumulated: AccumulatedGroups) -> RdmResult<PipelineOutput> {
        let engine = RdmEngine::new(self.config.engine.clone())?;
        let AccumulatedGroups { groups, skipped } = accumulated;

        let mut keys = Vec::with_capacity(groups.len());
        let mut rdms = Vec::with_capacity(groups.len());
        for (key, matrix) in groups {
            let rdm = engine
                .compute_from_responses(&matrix)
                .map_err(|e| e.in_group(key.as_str()))?;
            drop(matrix);

            let handle = match &self.store {
                Some(store) => {
                    store
                        .save(key.as_str(), &rdm)
                        .map_err(|e| e.in_group(key.as_str()))?;
                    GroupRdm::Stored(store.open_lazy(key.as_str())?)
                }
                None => GroupRdm::Resident(rdm),
            };
            info!(group = %key, "computed RDM");
            keys.push(key);
            rdms.push(handle);
        }

        let names: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let rsa = RsaMatrix::build(&names, &rdms, CompareMode::from(&self.config.rsa))?;

        Ok(PipelineOutput {
            groups: keys,
            rdms,
            rsa,
            skipped,
        })
    }

    /// Independent in-memory RSA per session; nothing is persisted.
    pub fn run_per_session(
        &self,
        sessions: Vec<(usize, AccumulatedGroups)>,
    ) -> RdmResult<Vec<SessionRsa>> {
        let in_memory = Pipeline {
            config: self.config.clone(),
            store: None,
        };
        sessions
            .into_iter()
            .map(|(session, accumulated)| {
                let out = in_memory.run(accumulated)?;
                info!(session, groups = out.groups.len(), "session RSA done");
                Ok(SessionRsa {
                    session,
                    rsa: out.rsa,
                    skipped: out.skipped,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn labels() -> LabelMap {
        LabelMap::parse("1 V1\n2 V2\n\n3 V3\n").expect("labels")
    }

    #[test]
    fn label_map_parses_code_name_lines() {
        let map = labels();
        assert_eq!(map.len(), 3);
        assert_eq!(map.code_of("V2"), Some(2));
        assert_eq!(map.name_of(3), Some("V3"));
        assert!(LabelMap::parse("x V1").is_err());
    }

    #[test]
    fn unknown_group_is_reported_not_fatal() {
        let acc = SessionAccumulator::new(&labels(), ["V1", "MT"]);
        let done = acc.finish().expect("finish");
        assert_eq!(
            done.skipped()[0],
            GroupSkip {
                group: GroupKey::from("MT"),
                session: None,
                reason: SkipReason::LabelNotFound
            }
        );
        // V1 never received rows
        assert_eq!(done.skipped()[1].reason, SkipReason::NoRows);
        assert!(done.groups().is_empty());
    }

    #[test]
    fn sessions_are_concatenated_per_group() {
        let mut acc = SessionAccumulator::new(&labels(), ["V1", "V2", "V3"]);
        let s1 = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let s2 = array![[7.0f32, 8.0, 9.0]];
        acc.add_session(1, &s1, &[1, 2, 1]).expect("session 1");
        acc.add_session(2, &s2, &[1, 2, 1]).expect("session 2");
        assert_eq!(acc.sessions(), 2);

        let done = acc.finish().expect("finish");
        let (key, v1) = &done.groups()[0];
        assert_eq!(key.as_str(), "V1");
        assert_eq!(v1, &array![[1.0f32, 3.0], [4.0, 6.0], [7.0, 9.0]]);
        assert_eq!(done.groups()[1].1, array![[2.0f32], [5.0], [8.0]]);

        let v3: Vec<_> = done
            .skipped()
            .iter()
            .filter(|s| s.group.as_str() == "V3")
            .map(|s| s.reason)
            .collect();
        assert_eq!(
            v3,
            vec![SkipReason::NoFeatures, SkipReason::NoFeatures, SkipReason::NoRows]
        );
    }

    #[test]
    fn inconsistent_group_width_is_fatal() {
        let mut acc = SessionAccumulator::new(&labels(), ["V1"]);
        acc.add_session(1, &array![[1.0f32, 2.0]], &[1, 1]).expect("session 1");
        let err = acc
            .add_session(2, &array![[1.0f32, 2.0]], &[1, 2])
            .unwrap_err();
        assert!(matches!(err, RdmError::Group { ref group, .. } if group == "V1"));
    }

    #[test]
    fn rejected_session_leaves_no_partial_state() {
        let mut acc = SessionAccumulator::new(&labels(), ["V1", "V2"]);
        acc.add_session(1, &array![[1.0f32, 2.0], [3.0, 4.0]], &[1, 2])
            .expect("session 1");
        // V1 is fine, V2 changes width and rejects the whole session
        assert!(acc
            .add_session(2, &array![[5.0f32, 6.0, 7.0]], &[1, 2, 2])
            .is_err());
        assert_eq!(acc.sessions(), 1);

        let done = acc.finish().expect("finish");
        assert_eq!(done.groups()[0].1, array![[1.0f32], [3.0]]);
        assert_eq!(done.groups()[1].1, array![[2.0f32], [4.0]]);
        assert!(done.skipped().is_empty());
    }

    #[test]
    fn skipped_groups_are_absent_from_pipeline_output() {
        let mut acc = SessionAccumulator::new(&labels(), ["V1", "MT", "V3"]);
        acc.add_session(
            1,
            &array![[1.0f32, 4.0, 2.0], [3.0, 1.0, 2.0], [2.0, 3.0, 9.0], [5.0, 5.0, 1.0]],
            &[1, 1, 1],
        )
        .expect("session");
        let out = Pipeline::new(AnalysisConfig::default())
            .expect("pipeline")
            .run(acc.finish().expect("finish"))
            .expect("run");

        assert_eq!(out.groups, vec![GroupKey::from("V1")]);
        assert_eq!(out.rsa.names().to_vec(), vec!["V1".to_string()]);
        assert_eq!(out.rdms.len(), 1);
        assert!(out.rdm("MT").is_none());
        assert!(out.rdm("V3").is_none());

        let reasons: Vec<_> = out
            .skipped
            .iter()
            .map(|s| (s.group.as_str(), s.reason))
            .collect();
        assert!(reasons.contains(&("MT", SkipReason::LabelNotFound)));
        assert!(reasons.contains(&("V3", SkipReason::NoRows)));
    }

    #[test]
    fn label_length_must_match_columns() {
        let mut acc = SessionAccumulator::new(&labels(), ["V1"]);
        assert!(matches!(
            acc.add_session(1, &array![[1.0f32, 2.0]], &[1]),
            Err(RdmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn degenerate_group_names_the_group() {
        let groups = AccumulatedGroups::from_matrices(vec![(
            GroupKey::from("V4"),
            array![[1.0f32, 2.0, 3.0], [5.0, 5.0, 5.0]],
        )]);
        let err = Pipeline::new(AnalysisConfig::default())
            .expect("pipeline")
            .run(groups)
            .unwrap_err();
        match err {
            RdmError::Group { group, source } => {
                assert_eq!(group, "V4");
                assert!(matches!(*source, RdmError::DegenerateRow { row: 1 }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
