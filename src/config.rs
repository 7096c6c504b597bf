//! Simulator wiring from the two configuration text files.
//!
//! The *definition* file declares components and composes the per-core
//! pipelines:
//!
//! ```text
//! component baseline-llc LLC
//! component mshr MSHR0
//! 0 MSHR0 LLC
//! all DRAM
//! ```
//!
//! The *configuration* file assigns parameter files (looked up under
//! `{components}/{type}/`) and one-shot overrides:
//!
//! ```text
//! LLC llc-2m.cfg
//! override LLC policy drrip
//! ```

use crate::cache;
use crate::component::Component;
use crate::dram;
use crate::mshr::Mshr;
use crate::prefetch;
use crate::sim::Simulator;
use crate::stall::Stall;
use crate::table;
use crate::tracer::TraceDump;
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown component type `{kind}`")]
    UnknownComponentKind { kind: String },

    #[error("component `{name}` defined twice")]
    DuplicateComponent { name: String },

    #[error("unknown component `{name}`")]
    UnknownComponent { name: String },

    #[error("unknown parameter `{parameter}` for component `{component}`")]
    UnknownParameter {
        component: String,
        parameter: String,
    },

    #[error("bad value `{value}` for parameter `{parameter}` of component `{component}`")]
    InvalidValue {
        component: String,
        parameter: String,
        value: String,
    },

    #[error("cpu {cpu} out of range (simulating {num_cpus} cpus)")]
    CpuOutOfRange { cpu: usize, num_cpus: usize },

    #[error("malformed line `{line}` in {file}")]
    MalformedLine { file: String, line: String },

    #[error("component parameter file `{0}` not found")]
    MissingComponentFile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Instantiate a component by its type name.
#[must_use]
pub fn create_component(kind: &str) -> Option<Box<dyn Component>> {
    let component: Box<dyn Component> = match kind {
        "trace" => Box::new(TraceDump::new()),
        "mshr" => Box::new(Mshr::new()),
        "cache" => Box::new(cache::DataCache::new()),
        "stall" => Box::new(Stall::new()),

        "baseline-llc" => Box::new(cache::BaselineLlc::new()),
        "dynamic-llc" => Box::new(cache::DynamicLlc::new()),
        "llc-vts" => Box::new(cache::VtsLlc::new()),
        "llc-awb" => Box::new(cache::AwbLlc::new()),
        "arc" => Box::new(cache::ArcCache::new()),
        "rtb-cache" => Box::new(cache::RtbCache::new()),
        "ship-ip" => Box::new(cache::ShipIpCache::new()),
        "mct" => Box::new(cache::MctCache::new()),
        "ucp" => Box::new(cache::UcpCache::new()),
        "dcp" => Box::new(cache::DcpCache::new()),
        "pacman" => Box::new(cache::PacmanCache::new()),
        "fdp" => Box::new(cache::FdpCache::new()),
        "fdp-ap" => Box::new(cache::FdpApCache::new()),

        "next-line-prefetcher" => Box::new(prefetch::NextLinePrefetcher::new()),
        "stride-prefetcher" => Box::new(prefetch::StridePrefetcher::new()),
        "stream-prefetcher" => Box::new(prefetch::StreamPrefetcher::new()),

        "simple-mc" => Box::new(dram::SimpleMemoryController::new()),
        "dram-ctlr" => Box::new(dram::DramController::new()),

        _ => return None,
    };
    Some(component)
}

/// Parse and apply a definition file.
pub fn apply_definition(sim: &mut Simulator, path: &Path) -> Result<(), Error> {
    let text = fs::read_to_string(path)?;
    let file = path.display().to_string();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let head = fields.next().expect("nonempty line");

        if head == "component" {
            let (Some(kind), Some(name)) = (fields.next(), fields.next()) else {
                return Err(Error::MalformedLine {
                    file,
                    line: line.to_string(),
                });
            };
            sim.register(kind, name)?;
        } else if head == "all" {
            for name in fields {
                let id = sim.lookup(name).ok_or_else(|| Error::UnknownComponent {
                    name: name.to_string(),
                })?;
                sim.push_all_pipelines(id);
            }
        } else if let Ok(cpu) = head.parse::<usize>() {
            if cpu >= sim.num_cpus() {
                return Err(Error::CpuOutOfRange {
                    cpu,
                    num_cpus: sim.num_cpus(),
                });
            }
            for name in fields {
                let id = sim.lookup(name).ok_or_else(|| Error::UnknownComponent {
                    name: name.to_string(),
                })?;
                sim.push_pipeline(cpu, id);
            }
        } else {
            return Err(Error::MalformedLine {
                file,
                line: line.to_string(),
            });
        }
    }
    Ok(())
}

/// Parse and apply a configuration file. Parameter files are resolved per
/// component type under `components_dir`.
pub fn apply_configuration(
    sim: &mut Simulator,
    path: &Path,
    components_dir: &Path,
) -> Result<(), Error> {
    let text = fs::read_to_string(path)?;
    let file = path.display().to_string();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let head = fields.next().expect("nonempty line");

        if head == "override" {
            let (Some(name), Some(key), Some(value)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::MalformedLine {
                    file,
                    line: line.to_string(),
                });
            };
            let id = sim.lookup(name).ok_or_else(|| Error::UnknownComponent {
                name: name.to_string(),
            })?;
            sim.component_mut(id).set_param(key, value)?;
        } else {
            let name = head;
            let Some(file_name) = fields.next() else {
                return Err(Error::MalformedLine {
                    file,
                    line: line.to_string(),
                });
            };
            let id = sim.lookup(name).ok_or_else(|| Error::UnknownComponent {
                name: name.to_string(),
            })?;
            let parameter_path = components_dir.join(sim.kind_of(id)).join(file_name);
            let parameters = fs::read_to_string(&parameter_path).map_err(|_| {
                Error::MissingComponentFile(parameter_path.display().to_string())
            })?;
            for parameter_line in parameters.lines() {
                let mut kv = parameter_line.split_whitespace();
                if let (Some(key), Some(value)) = (kv.next(), kv.next()) {
                    sim.component_mut(id).set_param(key, value)?;
                }
            }
        }
    }
    Ok(())
}

/// Parse one typed parameter value.
pub fn parse<T: FromStr>(component: &str, parameter: &str, value: &str) -> Result<T, Error> {
    value.parse().map_err(|_| Error::InvalidValue {
        component: component.to_string(),
        parameter: parameter.to_string(),
        value: value.to_string(),
    })
}

/// Booleans are written as `0` / non-zero.
pub fn parse_bool(component: &str, parameter: &str, value: &str) -> Result<bool, Error> {
    let numeric: u32 = parse(component, parameter, value)?;
    Ok(numeric != 0)
}

/// A replacement-policy name, validated against the policy registry.
pub fn parse_policy(component: &str, parameter: &str, value: &str) -> Result<String, Error> {
    if !table::policy_exists(value) {
        return Err(Error::InvalidValue {
            component: component.to_string(),
            parameter: parameter.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::{apply_configuration, apply_definition, Error};
    use crate::sim::Simulator;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn definition_builds_pipelines() {
        let path = write_file(
            "cachesim-def-basic",
            "component mshr MSHR0\ncomponent mshr MSHR1\ncomponent baseline-llc LLC\n\n0 MSHR0\n1 MSHR1\nall LLC\n",
        );
        let mut sim = Simulator::for_testing(2);
        apply_definition(&mut sim, &path).unwrap();
        assert!(sim.lookup("MSHR0").is_some());
        assert!(sim.lookup("LLC").is_some());
    }

    #[test]
    fn unknown_component_type_is_rejected() {
        let path = write_file("cachesim-def-unknown", "component warp-scheduler X\n");
        let mut sim = Simulator::for_testing(1);
        assert!(matches!(
            apply_definition(&mut sim, &path),
            Err(Error::UnknownComponentKind { .. })
        ));
    }

    #[test]
    fn override_and_parameter_files() {
        let definition = write_file("cachesim-def-cfg", "component baseline-llc LLC\nall LLC\n");
        let components = std::env::temp_dir().join("cachesim-components");
        std::fs::create_dir_all(components.join("baseline-llc")).unwrap();
        std::fs::write(
            components.join("baseline-llc").join("small.cfg"),
            "size 512\nassociativity 8\n",
        )
        .unwrap();
        let configuration = write_file(
            "cachesim-cfg-basic",
            "LLC small.cfg\noverride LLC policy drrip\n",
        );

        let mut sim = Simulator::for_testing(1);
        apply_definition(&mut sim, &definition).unwrap();
        apply_configuration(&mut sim, &configuration, &components).unwrap();
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let definition = write_file("cachesim-def-param", "component mshr M\n");
        let configuration = write_file("cachesim-cfg-param", "override M warp-size 32\n");
        let mut sim = Simulator::for_testing(1);
        apply_definition(&mut sim, &definition).unwrap();
        assert!(matches!(
            apply_configuration(&mut sim, &configuration, &std::env::temp_dir()),
            Err(Error::UnknownParameter { .. })
        ));
    }
}
