//! Named missions and the mission file format.
//!
//! A mission file is line oriented: the first line is a compact JSON header
//! `{"name":..,"intro":..}`, every following line is one step frame in
//! execution order.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, RoarmError};
use crate::step::MissionStep;

pub const DEFAULT_INTRO: &str = "Mission";
const UNNAMED: &str = "unnamed_mission";

#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    pub name: String,
    pub intro: String,
    pub steps: Vec<MissionStep>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(default = "unnamed")]
    name: String,
    #[serde(default = "default_intro")]
    intro: String,
}

fn unnamed() -> String {
    UNNAMED.to_string()
}

fn default_intro() -> String {
    DEFAULT_INTRO.to_string()
}

impl Mission {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            intro: DEFAULT_INTRO.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn to_text(&self) -> Result<String> {
        let header = Header {
            name: self.name.clone(),
            intro: self.intro.clone(),
        };
        let mut out = serde_json::to_string(&header)?;
        out.push('\n');
        for step in &self.steps {
            out.push_str(&serde_json::to_string(step)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse a whole mission. Any bad line fails the whole parse.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, first) = lines
            .next()
            .ok_or_else(|| RoarmError::File("mission file is empty".to_string()))?;
        let header: Header = serde_json::from_str(first.trim())
            .map_err(|e| RoarmError::File(format!("bad mission header: {}", e)))?;
        let mut steps = Vec::new();
        for (idx, line) in lines {
            let step: MissionStep = serde_json::from_str(line.trim())
                .map_err(|e| RoarmError::File(format!("line {}: {}", idx + 1, e)))?;
            step.validate()
                .map_err(|e| RoarmError::File(format!("line {}: {}", idx + 1, e)))?;
            steps.push(step);
        }
        Ok(Self {
            name: header.name,
            intro: header.intro,
            steps,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.to_text()?;
        fs::write(path, text).map_err(|e| RoarmError::File(format!("{}: {}", path.display(), e)))?;
        info!(target: "mission", "Mission '{}' saved to {}", self.name, path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| RoarmError::File(format!("{}: {}", path.display(), e)))?;
        let mission = Self::from_text(&text).map_err(|e| match e {
            RoarmError::File(msg) => RoarmError::File(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;
        info!(target: "mission", "Mission '{}' loaded from {} ({} steps)", mission.name, path.display(), mission.len());
        Ok(mission)
    }
}

/// The missions owned by one robot plus the currently selected one.
///
/// Every step operation works on the selected mission and fails with
/// `NoMissionSelected` when there is none. Failed operations leave the model
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct MissionModel {
    missions: BTreeMap<String, Mission>,
    selected: Option<String>,
}

impl MissionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty mission and select it.
    pub fn create(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RoarmError::Validation("mission name must not be empty".to_string()));
        }
        if self.missions.contains_key(name) {
            return Err(RoarmError::DuplicateName(name.to_string()));
        }
        self.missions.insert(name.to_string(), Mission::new(name));
        self.selected = Some(name.to_string());
        info!(target: "mission", "Mission '{}' created", name);
        Ok(())
    }

    pub fn select(&mut self, name: &str) -> Result<()> {
        if !self.missions.contains_key(name) {
            return Err(RoarmError::UnknownMission(name.to_string()));
        }
        self.selected = Some(name.to_string());
        Ok(())
    }

    /// Add a whole mission (e.g. one read from a file) and select it. An
    /// existing mission with the same name is only replaced when `overwrite`.
    pub fn insert_mission(&mut self, mission: Mission, overwrite: bool) -> Result<()> {
        if self.missions.contains_key(&mission.name) && !overwrite {
            return Err(RoarmError::DuplicateName(mission.name));
        }
        let name = mission.name.clone();
        self.missions.insert(name.clone(), mission);
        self.selected = Some(name);
        Ok(())
    }

    pub fn remove_mission(&mut self, name: &str) -> Result<Mission> {
        let mission = self
            .missions
            .remove(name)
            .ok_or_else(|| RoarmError::UnknownMission(name.to_string()))?;
        if self.selected.as_deref() == Some(name) {
            self.selected = None;
        }
        Ok(mission)
    }

    pub fn names(&self) -> Vec<String> {
        self.missions.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Mission> {
        self.missions.get(name)
    }

    pub fn selected_name(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn selected(&self) -> Result<&Mission> {
        self.selected
            .as_ref()
            .and_then(|name| self.missions.get(name))
            .ok_or(RoarmError::NoMissionSelected)
    }

    fn selected_mut(&mut self) -> Result<&mut Mission> {
        match self.selected.as_ref() {
            Some(name) => self.missions.get_mut(name).ok_or(RoarmError::NoMissionSelected),
            None => Err(RoarmError::NoMissionSelected),
        }
    }

    pub fn step(&self, index: usize) -> Result<&MissionStep> {
        let mission = self.selected()?;
        mission.steps.get(index).ok_or(RoarmError::IndexOutOfRange {
            index,
            len: mission.len(),
        })
    }

    /// Returns the index of the new step.
    pub fn append(&mut self, step: MissionStep) -> Result<usize> {
        step.validate()?;
        let mission = self.selected_mut()?;
        mission.steps.push(step);
        Ok(mission.len() - 1)
    }

    /// Insert so the new step ends up at `index`. `index == len` appends.
    pub fn insert(&mut self, index: usize, step: MissionStep) -> Result<()> {
        step.validate()?;
        let mission = self.selected_mut()?;
        if index > mission.len() {
            return Err(RoarmError::IndexOutOfRange { index, len: mission.len() });
        }
        mission.steps.insert(index, step);
        Ok(())
    }

    pub fn replace(&mut self, index: usize, step: MissionStep) -> Result<MissionStep> {
        step.validate()?;
        let mission = self.selected_mut()?;
        let len = mission.len();
        let slot = mission
            .steps
            .get_mut(index)
            .ok_or(RoarmError::IndexOutOfRange { index, len })?;
        Ok(std::mem::replace(slot, step))
    }

    pub fn delete(&mut self, index: usize) -> Result<MissionStep> {
        let mission = self.selected_mut()?;
        if index >= mission.len() {
            return Err(RoarmError::IndexOutOfRange { index, len: mission.len() });
        }
        Ok(mission.steps.remove(index))
    }

    /// Insert a copy of step `index` right after it. Returns the copy's index.
    pub fn duplicate(&mut self, index: usize) -> Result<usize> {
        let mission = self.selected_mut()?;
        let copy = mission
            .steps
            .get(index)
            .cloned()
            .ok_or(RoarmError::IndexOutOfRange { index, len: mission.len() })?;
        mission.steps.insert(index + 1, copy);
        Ok(index + 1)
    }

    /// Drag-and-drop reorder. `drop` is the row the step is dropped on, in
    /// `0..=len` (`len` means past the last row). The step is popped first, so
    /// a drop point after the source shifts up by one and the step lands
    /// directly above the drop row. Returns the step's new index.
    pub fn move_step(&mut self, from: usize, drop: usize) -> Result<usize> {
        let mission = self.selected_mut()?;
        let len = mission.len();
        if from >= len {
            return Err(RoarmError::IndexOutOfRange { index: from, len });
        }
        if drop > len {
            return Err(RoarmError::IndexOutOfRange { index: drop, len });
        }
        let to = if drop > from { drop - 1 } else { drop };
        let step = mission.steps.remove(from);
        mission.steps.insert(to, step);
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepKind;

    fn model_with(n: usize) -> MissionModel {
        let mut model = MissionModel::new();
        model.create("m").unwrap();
        for i in 0..n {
            model.append(MissionStep::delay(i as i64)).unwrap();
        }
        model
    }

    fn delays(model: &MissionModel) -> Vec<i64> {
        model
            .selected()
            .unwrap()
            .steps
            .iter()
            .map(|s| match s.command {
                crate::step::StepCommand::Delay { ms } => ms,
                _ => -1,
            })
            .collect()
    }

    #[test]
    fn create_rejects_duplicates() {
        let mut model = MissionModel::new();
        model.create("pick").unwrap();
        assert_eq!(model.create("pick"), Err(RoarmError::DuplicateName("pick".to_string())));
        assert_eq!(model.names(), vec!["pick".to_string()]);
        assert_eq!(model.selected_name(), Some("pick"));
    }

    #[test]
    fn operations_need_a_selected_mission() {
        let mut model = MissionModel::new();
        assert_eq!(model.append(MissionStep::delay(1)), Err(RoarmError::NoMissionSelected));
        assert_eq!(model.delete(0), Err(RoarmError::NoMissionSelected));
        assert_eq!(model.duplicate(0), Err(RoarmError::NoMissionSelected));
        assert_eq!(model.move_step(0, 1), Err(RoarmError::NoMissionSelected));
    }

    #[test]
    fn index_errors_leave_model_unchanged() {
        let mut model = model_with(3);
        assert_eq!(model.delete(3), Err(RoarmError::IndexOutOfRange { index: 3, len: 3 }));
        assert!(model.insert(4, MissionStep::delay(9)).is_err());
        assert!(model.move_step(0, 4).is_err());
        assert!(model.duplicate(7).is_err());
        assert_eq!(delays(&model), vec![0, 1, 2]);
    }

    #[test]
    fn invalid_step_is_rejected_before_mutation() {
        let mut model = model_with(1);
        let bad = MissionStep::movement(0.0, 0.0, 0.0, 0.0, -1.0, 10.0);
        assert!(matches!(model.append(bad.clone()), Err(RoarmError::Validation(_))));
        assert!(matches!(model.insert(0, bad), Err(RoarmError::Validation(_))));
        assert!(matches!(model.append(MissionStep::delay(-5)), Err(RoarmError::Validation(_))));
        assert_eq!(delays(&model), vec![0]);
    }

    #[test]
    fn duplicate_inserts_after() {
        let mut model = model_with(3);
        assert_eq!(model.duplicate(1).unwrap(), 2);
        assert_eq!(delays(&model), vec![0, 1, 1, 2]);
    }

    #[test]
    fn move_down_matches_remove_then_insert() {
        let mut model = model_with(4);
        assert_eq!(model.move_step(0, 3).unwrap(), 2);
        let mut expected = vec![0, 1, 2, 3];
        let s = expected.remove(0);
        expected.insert(2, s);
        assert_eq!(delays(&model), expected);
    }

    #[test]
    fn move_up_and_to_end() {
        let mut model = model_with(4);
        model.move_step(3, 0).unwrap();
        assert_eq!(delays(&model), vec![3, 0, 1, 2]);
        model.move_step(0, 4).unwrap();
        assert_eq!(delays(&model), vec![0, 1, 2, 3]);
        // Dropping onto itself is a no-op.
        model.move_step(2, 2).unwrap();
        assert_eq!(delays(&model), vec![0, 1, 2, 3]);
    }

    #[test]
    fn text_round_trip() {
        let mut mission = Mission::new("demo");
        mission.steps = vec![
            MissionStep::movement(0.0, 0.0, 0.0, 0.0, 2.5, 10.0),
            MissionStep::delay(500),
            MissionStep::pwm(0, 255),
        ];
        let text = mission.to_text().unwrap();
        assert!(text.starts_with(r#"{"name":"demo","intro":"Mission"}"#));
        let loaded = Mission::from_text(&text).unwrap();
        assert_eq!(loaded, mission);
        let kinds: Vec<StepKind> = loaded.steps.iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec![StepKind::Movement, StepKind::Delay, StepKind::Suction]);
    }

    #[test]
    fn bad_lines_fail_the_whole_load() {
        assert!(matches!(Mission::from_text(""), Err(RoarmError::File(_))));
        assert!(matches!(Mission::from_text("not json\n"), Err(RoarmError::File(_))));
        let text = "{\"name\":\"x\",\"intro\":\"Mission\"}\n{\"T\":111,\"cmd\":5}\n{oops}\n";
        assert!(matches!(Mission::from_text(text), Err(RoarmError::File(_))));
        let text = "{\"name\":\"x\"}\n{\"T\":104,\"x\":0,\"y\":0,\"z\":0,\"t\":0,\"spd\":0,\"acc\":1}\n";
        assert!(matches!(Mission::from_text(text), Err(RoarmError::File(_))));
    }

    #[test]
    fn header_defaults() {
        let m = Mission::from_text("{}\n").unwrap();
        assert_eq!(m.name, "unnamed_mission");
        assert_eq!(m.intro, DEFAULT_INTRO);
        assert!(m.is_empty());
    }

    #[test]
    fn insert_mission_respects_overwrite() {
        let mut model = model_with(2);
        let incoming = Mission::new("m");
        assert_eq!(
            model.insert_mission(incoming.clone(), false),
            Err(RoarmError::DuplicateName("m".to_string()))
        );
        assert_eq!(model.selected().unwrap().len(), 2);
        model.insert_mission(incoming, true).unwrap();
        assert_eq!(model.selected().unwrap().len(), 0);
    }
}
