use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use roarm_driver::device_link::RecordingSink;
use roarm_driver::frame::Frame;
use roarm_driver::mission::Mission;
use roarm_driver::notifications;
use roarm_driver::pose::{Pose, PoseStore};
use roarm_driver::robot::{Robot, RobotSettings};
use roarm_driver::step::{MissionStep, StepCommand, StepKind};
use roarm_driver::RoarmError;

fn temp_mission() -> PathBuf {
    std::env::temp_dir().join(format!("roarm-mission-{}.mission", Uuid::new_v4()))
}

fn dry_robot(name: &str) -> (Robot, RecordingSink) {
    let (notifier, _receiver) = notifications::channel(4096);
    let sink = RecordingSink::new();
    let settings = RobotSettings::default();
    let robot = Robot::new(
        name,
        Arc::new(sink.clone()),
        PoseStore::new(settings.startup_pose),
        settings,
        notifier,
    );
    (robot, sink)
}

#[test]
fn mission_file_round_trip() {
    let path = temp_mission();
    let mut mission = Mission::new("pick_and_place");
    mission.steps = vec![
        MissionStep::movement(0.0, 0.0, 0.0, 0.0, 2.5, 10.0),
        MissionStep::delay(500),
        MissionStep::pwm(0, 255),
    ];
    mission.save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 4);
    assert!(text.lines().next().unwrap().contains("pick_and_place"));

    let loaded = Mission::load(&path).unwrap();
    assert_eq!(loaded, mission);
    let kinds: Vec<StepKind> = loaded.steps.iter().map(|s| s.kind()).collect();
    assert_eq!(kinds, vec![StepKind::Movement, StepKind::Delay, StepKind::Suction]);
    let _ = std::fs::remove_file(path);
}

#[test]
fn unknown_frames_and_extra_fields_survive_a_reload() {
    let path = temp_mission();
    let text = concat!(
        "{\"name\":\"custom\",\"intro\":\"Mission\"}\n",
        "\n",
        "{\"T\":999,\"foo\":1,\"bar\":\"baz\"}\n",
        "{\"T\":104,\"x\":1.0,\"y\":2.0,\"z\":3.0,\"t\":0.5,\"note\":\"keep me\"}\n",
    );
    std::fs::write(&path, text).unwrap();

    let mission = Mission::load(&path).unwrap();
    assert_eq!(mission.len(), 2);
    assert_eq!(mission.steps[0].kind(), StepKind::Other);
    assert_eq!(mission.steps[0].to_frame().code(), 999);
    // Missing spd/acc fall back to the defaults.
    match &mission.steps[1].command {
        StepCommand::Movement(m) => {
            assert_eq!((m.x, m.y, m.z, m.t), (1.0, 2.0, 3.0, 0.5));
            assert_eq!((m.spd, m.acc), (2.5, 10.0));
        }
        other => panic!("expected a movement, got {:?}", other),
    }

    mission.save(&path).unwrap();
    let again = Mission::load(&path).unwrap();
    assert_eq!(again, mission);
    assert_eq!(again.steps[0].to_frame(), Frame::new(999).with("foo", 1).with("bar", "baz"));
    assert_eq!(
        again.steps[1].to_frame().get("note").and_then(|v| v.as_str()),
        Some("keep me")
    );
    let _ = std::fs::remove_file(path);
}

#[test]
fn bad_mission_files_are_rejected() {
    let path = temp_mission();
    for text in [
        "",
        "not a header\n",
        "{\"name\":\"m\"}\n{\"T\":104,\"x\":1}\n",
        "{\"name\":\"m\"}\n{\"T\":104,\"x\":1,\"y\":1,\"z\":1,\"t\":1,\"spd\":0}\n",
        "{\"name\":\"m\"}\n[1,2,3]\n",
    ] {
        std::fs::write(&path, text).unwrap();
        assert!(matches!(Mission::load(&path), Err(RoarmError::File(_))), "{:?}", text);
    }
    let _ = std::fs::remove_file(&path);
    assert!(matches!(Mission::load(&path), Err(RoarmError::File(_))));
}

#[test]
fn recorded_mission_saves_and_loads_on_another_robot() {
    let path = temp_mission();
    let (recorder, sink) = dry_robot("Robot 1");

    recorder.create_mission("demo").unwrap();
    recorder.init_robot().unwrap();
    recorder.pose_store().update(|p| p.z -= 50.0);
    recorder.add_current_pose_step().unwrap();
    recorder.suction_on().unwrap();
    recorder.add_delay(250).unwrap();
    recorder.suction_off().unwrap();
    recorder.add_led_on_step().unwrap();
    recorder.save_mission(&path).unwrap();

    let codes: Vec<i64> = sink.frames().iter().map(|f| f.code()).collect();
    // init move, two pwm frames, then the saved-mission notice
    assert_eq!(codes, vec![104, 113, 113, 221]);
    assert_eq!(sink.frames()[3].get("name").and_then(|v| v.as_str()), Some("demo"));

    let (player, _) = dry_robot("Robot 2");
    assert_eq!(player.load_mission(&path, false).unwrap(), "demo");
    let steps = player.missions().selected().unwrap().steps.clone();
    assert_eq!(steps, recorder.missions().selected().unwrap().steps);
    assert_eq!(steps.len(), 6);
    match &steps[1].command {
        StepCommand::Movement(m) => {
            let startup = Pose::STARTUP;
            assert_eq!(m.z, startup.z - 50.0);
        }
        other => panic!("expected a movement, got {:?}", other),
    }

    // Same name again needs an explicit overwrite.
    assert!(matches!(
        player.load_mission(&path, false),
        Err(RoarmError::DuplicateName(_))
    ));
    assert_eq!(player.load_mission(&path, true).unwrap(), "demo");
    let _ = std::fs::remove_file(path);
}

#[test]
fn dry_run_plays_every_transmitted_step() {
    let (robot, sink) = dry_robot("Robot 1");
    robot.create_mission("short").unwrap();
    {
        let mut missions = robot.missions();
        missions.append(MissionStep::movement(235.0, 0.0, 234.0, 3.14, 2.5, 10.0)).unwrap();
        missions.append(MissionStep::delay(10)).unwrap();
        missions.append(MissionStep::led(255)).unwrap();
    }

    let report = robot.play_mission(2).unwrap().wait();
    assert_eq!(report.executed_steps, 6);
    assert_eq!(report.total_steps, 6);
    let codes: Vec<i64> = sink.frames().iter().map(|f| f.code()).collect();
    assert_eq!(codes, vec![104, 114, 104, 114]);
}
