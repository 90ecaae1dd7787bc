use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::core::models::ContainerState;
use crate::core::runtime::ContainerRuntime;
use crate::error::{RuntimeError, RuntimeOperation};

pub mod docker;
pub mod filesystem;
pub mod simulated;

pub use docker::DockerRuntime;
pub use filesystem::FilesystemSink;
pub use simulated::{SimulatedRuntime, Simulator};

/// Pick the container runtime for this run.
///
/// In simulation mode a demo container is seeded and stdin accepts
/// controller commands.
pub fn get_runtime(config: &AppConfig) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
    if !config.simulation {
        return Ok(Arc::new(DockerRuntime::connect()?));
    }

    let (runtime, simulator) = SimulatedRuntime::new();
    seed_demo(&simulator, &config.label_prefix);
    info!("Simulation mode: 'add <name>', 'rm <name>', 'fail <op> <name>', 'clear', 'state <name>'");

    let prefix = config.label_prefix.clone();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lines().map_while(Result::ok) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["add", name] => seed_container(&simulator, &prefix, name),
                ["rm", name] => {
                    simulator.remove_container(&sim_id(name));
                }
                ["fail", op, name] => match parse_operation(op) {
                    Some(op) => simulator.fail(op, &sim_id(name), 1),
                    None => println!("(Simulator) Unknown operation '{}'", op),
                },
                ["clear"] => simulator.clear_faults(),
                ["state", name] => println!("(Simulator) {}: {:?}", name, simulator.state(&sim_id(name))),
                _ => println!(
                    "(Simulator) Use: 'add <name>', 'rm <name>', 'fail <op> <name>', 'clear' or 'state <name>'"
                ),
            }
        }
    });

    Ok(Arc::new(runtime))
}

fn sim_id(name: &str) -> String {
    format!("sim-{}", name)
}

fn seed_demo(simulator: &Simulator, prefix: &str) {
    seed_container(simulator, prefix, "demo-db");
}

fn seed_container(simulator: &Simulator, prefix: &str, name: &str) {
    let id = sim_id(name);
    let enable = format!("{}.enable", prefix);
    let schedule = format!("{}.schedule", prefix);
    let volumes = format!("{}.volumes", prefix);
    simulator.add_container(
        &id,
        name,
        &[
            (enable.as_str(), "true"),
            (schedule.as_str(), "* * * * *"),
            (volumes.as_str(), "data:/var/lib/data,config:/etc/app"),
        ],
        ContainerState::Running,
    );
    simulator.set_file(&id, "/var/lib/data", format!("{} data\n", name).repeat(4096));
    simulator.set_file(&id, "/etc/app", format!("name = \"{}\"\n", name));
}

fn parse_operation(value: &str) -> Option<RuntimeOperation> {
    use RuntimeOperation::*;
    [Ping, List, Inspect, Pause, Unpause, Stop, Start, Exec, CopyOut]
        .into_iter()
        .find(|op| op.as_str() == value)
}
