//! Sensor models: through-beam light barriers, the HBW reference switch,
//! and the conveyor's rib-detection trail sensor pair.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorKind {
    LightBarrier,
    ReferenceSwitch,
    TrailSensor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub component_id: String,
    pub kind: SensorKind,
    pub triggered: bool,
    pub trigger_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trigger_ms: Option<u64>,
}

/// Through-beam sensor: triggered while an object sits inside its window.
/// Rising edges increment the trigger count.
#[derive(Debug)]
pub struct LightBarrier {
    component_id: &'static str,
    window_start_mm: f64,
    window_end_mm: f64,
    triggered: bool,
    trigger_count: u64,
    last_trigger_ms: Option<u64>,
}

impl LightBarrier {
    pub fn new(component_id: &'static str, center_mm: f64, half_window_mm: f64) -> Self {
        Self {
            component_id,
            window_start_mm: center_mm - half_window_mm,
            window_end_mm: center_mm + half_window_mm,
            triggered: false,
            trigger_count: 0,
            last_trigger_ms: None,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// `object_mm` is the object position, `None` when nothing is on the
    /// belt segment this barrier watches.
    pub fn update(&mut self, object_mm: Option<f64>, now_ms: u64) -> SensorSnapshot {
        let was = self.triggered;
        self.triggered = object_mm
            .map(|p| p >= self.window_start_mm && p <= self.window_end_mm)
            .unwrap_or(false);
        if self.triggered && !was {
            self.trigger_count += 1;
            self.last_trigger_ms = Some(now_ms);
        }
        SensorSnapshot {
            component_id: self.component_id.to_string(),
            kind: SensorKind::LightBarrier,
            triggered: self.triggered,
            trigger_count: self.trigger_count,
            last_trigger_ms: self.last_trigger_ms,
        }
    }
}

/// Home-position switch: closed while every axis is inside the home window.
#[derive(Debug)]
pub struct ReferenceSwitch {
    component_id: &'static str,
    triggered: bool,
    trigger_count: u64,
    last_trigger_ms: Option<u64>,
}

impl ReferenceSwitch {
    pub fn new(component_id: &'static str) -> Self {
        Self {
            component_id,
            triggered: false,
            trigger_count: 0,
            last_trigger_ms: None,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn update(&mut self, at_home: bool, now_ms: u64) -> SensorSnapshot {
        if at_home && !self.triggered {
            self.trigger_count += 1;
            self.last_trigger_ms = Some(now_ms);
        }
        self.triggered = at_home;
        SensorSnapshot {
            component_id: self.component_id.to_string(),
            kind: SensorKind::ReferenceSwitch,
            triggered: self.triggered,
            trigger_count: self.trigger_count,
            last_trigger_ms: self.last_trigger_ms,
        }
    }
}

/// Alternating sensor pair that toggles every `rib_spacing_mm` of belt
/// travel. The two outputs are complementary; a changing pattern proves the
/// belt is physically moving without an encoder.
#[derive(Debug)]
pub struct TrailSensorPair {
    rib_spacing_mm: f64,
    last_rib_mm: f64,
    toggle: bool,
    toggles: u64,
}

impl TrailSensorPair {
    pub fn new(rib_spacing_mm: f64) -> Self {
        Self {
            rib_spacing_mm,
            last_rib_mm: 0.0,
            toggle: false,
            toggles: 0,
        }
    }

    pub fn update(&mut self, belt_mm: f64, now_ms: u64) -> [SensorSnapshot; 2] {
        if (belt_mm - self.last_rib_mm).abs() >= self.rib_spacing_mm {
            self.toggle = !self.toggle;
            self.toggles += 1;
            self.last_rib_mm = belt_mm;
        }
        let snap = |id: &'static str, triggered: bool| SensorSnapshot {
            component_id: id.to_string(),
            kind: SensorKind::TrailSensor,
            triggered,
            trigger_count: self.toggles,
            last_trigger_ms: Some(now_ms),
        };
        [snap("CONV_TS_I5", self.toggle), snap("CONV_TS_I6", !self.toggle)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_barrier_counts_rising_edges_only() {
        let mut lb = LightBarrier::new("CONV_L1", 100.0, 25.0);
        assert!(!lb.update(Some(50.0), 0).triggered);
        assert!(lb.update(Some(80.0), 100).triggered);
        // Still inside the window: no extra count.
        assert!(lb.update(Some(120.0), 200).triggered);
        assert!(!lb.update(Some(130.0), 300).triggered);
        let snap = lb.update(Some(100.0), 400);
        assert_eq!(snap.trigger_count, 2);
        assert_eq!(snap.last_trigger_ms, Some(400));
    }

    #[test]
    fn light_barrier_window_boundaries_inclusive() {
        let mut lb = LightBarrier::new("CONV_L2", 400.0, 25.0);
        assert!(lb.update(Some(375.0), 0).triggered);
        assert!(lb.update(Some(425.0), 0).triggered);
        assert!(!lb.update(Some(425.1), 0).triggered);
        assert!(!lb.update(None, 0).triggered);
    }

    #[test]
    fn trail_pair_alternates_with_belt_travel() {
        let mut pair = TrailSensorPair::new(5.0);
        let [i5, i6] = pair.update(0.0, 0);
        assert_ne!(i5.triggered, i6.triggered);
        let before = i5.triggered;
        let [i5, _] = pair.update(5.0, 100);
        assert_ne!(i5.triggered, before);
        // Less than one rib of travel: no toggle.
        let [i5b, _] = pair.update(7.0, 200);
        assert_eq!(i5.triggered, i5b.triggered);
    }

    #[test]
    fn reference_switch_counts_homecomings() {
        let mut sw = ReferenceSwitch::new("HBW_REF_SW");
        sw.update(true, 0);
        sw.update(true, 100);
        sw.update(false, 200);
        let snap = sw.update(true, 300);
        assert_eq!(snap.trigger_count, 2);
        assert!(snap.triggered);
    }
}
