//! OpenDSS master file reader
//!
//! Reads the subset of the OpenDSS scripting language that feeder models use
//! to describe topology: `New` definitions for circuits, voltage sources,
//! line codes, lines, transformers, loads, PV systems and capacitors, plus
//! `Redirect`/`Compile` and `SetKVBase`. Everything else (solution settings,
//! load shapes, monitors, controls) is skipped.
//!
//! OpenDSS does not store bus voltage bases in the script, so they are
//! derived: explicit `SetKVBase` first, then source and transformer winding
//! ratings, spread across lines, and finally the rated kV of attached loads
//! and devices.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::DssError;
use crate::graph::SQRT_3;
use crate::models::{
    Bus, Capacitor, GridModel, Line, Load, Phase, SequenceImpedance, Solar, Transformer,
    VoltageSource,
};

// OpenDSS defaults for properties a script leaves out
const DEFAULT_SOURCE_KV: f64 = 115.0;
const DEFAULT_KV: f64 = 12.47;
const DEFAULT_LOAD_KW: f64 = 10.0;
const DEFAULT_LOAD_PF: f64 = 0.88;
const DEFAULT_PMPP: f64 = 500.0;
const DEFAULT_CAP_KVAR: f64 = 1200.0;
const DEFAULT_XFMR_KVA: f64 = 1000.0;
const DEFAULT_XFMR_R: f64 = 0.2;
const DEFAULT_XFMR_XHL: f64 = 7.0;
const DEFAULT_NORMAMPS: f64 = 400.0;
const DEFAULT_LINE_Z: SequenceImpedance = SequenceImpedance {
    r0: 0.1784,
    r1: 0.058,
    x0: 0.4047,
    x1: 0.1206,
};

/// Read a master file and everything it redirects to.
///
/// The model is named after the directory holding the master file.
pub fn read_master(path: &Path) -> Result<GridModel, DssError> {
    let mut reader = DssReader::new()?;
    reader.run_file(path)?;
    let name = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    reader.finish(name)
}

/// Read a script held in memory. Redirects resolve against `base_dir`.
pub fn read_script(content: &str, base_dir: &Path) -> Result<GridModel, DssError> {
    let mut reader = DssReader::new()?;
    reader.run_script(content, Path::new("<script>"), base_dir)?;
    reader.finish(String::new())
}

/// Miles per OpenDSS length unit
fn miles_per_unit(units: &str) -> Result<f64, String> {
    match units.to_ascii_lowercase().as_str() {
        "" | "none" | "mi" => Ok(1.0),
        "kft" => Ok(0.189_393_94),
        "km" => Ok(0.621_371_19),
        "m" => Ok(0.000_621_371_19),
        "ft" => Ok(0.000_189_393_94),
        "in" => Ok(1.578_282_8e-5),
        "cm" => Ok(6.213_711_9e-6),
        other => Err(format!("unknown length unit '{other}'")),
    }
}

fn node_phase(node: u32) -> Option<Phase> {
    match node {
        1 => Some(Phase::A),
        2 => Some(Phase::B),
        3 => Some(Phase::C),
        0 | 4 => Some(Phase::N),
        _ => None,
    }
}

fn unquote(value: &str) -> &str {
    value.trim_matches(|c| matches!(c, '"' | '\'' | '(' | ')' | '[' | ']'))
}

fn parse_num(key: &str, value: &str) -> Result<f64, String> {
    unquote(value)
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("{key}={value} is not a number"))
}

fn split_list(value: &str) -> Vec<&str> {
    unquote(value)
        .split(|c: char| c.is_whitespace() || c == ',' || c == '|')
        .filter(|s| !s.is_empty())
        .collect()
}

/// Positive- and zero-sequence impedance of a symmetric phase matrix given as
/// a lower triangle or a full square.
fn sequence_from_matrix(values: &[f64]) -> Option<(f64, f64)> {
    let n = (1..=3).find(|n| values.len() == n * (n + 1) / 2 || values.len() == n * n)?;
    let at = |i: usize, j: usize| {
        if values.len() == n * n {
            values[i * n + j]
        } else {
            let (i, j) = if i >= j { (i, j) } else { (j, i) };
            values[i * (i + 1) / 2 + j]
        }
    };

    let self_z = (0..n).map(|i| at(i, i)).sum::<f64>() / n as f64;
    if n == 1 {
        return Some((self_z, self_z));
    }
    let mut mutual = Vec::new();
    for i in 0..n {
        for j in 0..i {
            mutual.push(at(i, j));
        }
    }
    let mutual_z = mutual.iter().sum::<f64>() / mutual.len() as f64;
    let zero = self_z + (n as f64 - 1.0) * mutual_z;
    Some((zero, self_z - mutual_z))
}

/// `key=value` pairs of one command, in script order. Positional values have no key.
struct Params {
    items: Vec<(Option<String>, String)>,
}

impl Params {
    fn parse(re: &Regex, text: &str) -> Self {
        let items = re
            .captures_iter(text)
            .map(|cap| {
                (
                    cap.get(1).map(|k| k.as_str().to_ascii_lowercase()),
                    cap[2].to_string(),
                )
            })
            .collect();
        Params { items }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .rev()
            .find(|(k, _)| k.as_deref() == Some(key))
            .map(|(_, v)| v.as_str())
    }

    fn num(&self, key: &str) -> Result<Option<f64>, String> {
        self.get(key).map(|v| parse_num(key, v)).transpose()
    }

    fn num_or(&self, key: &str, default: f64) -> Result<f64, String> {
        Ok(self.num(key)?.unwrap_or(default))
    }

    fn nums(&self, key: &str) -> Result<Option<Vec<f64>>, String> {
        self.get(key)
            .map(|v| {
                split_list(v)
                    .into_iter()
                    .map(|item| parse_num(key, item))
                    .collect()
            })
            .transpose()
    }

    fn count_or(&self, key: &str, default: usize) -> Result<usize, String> {
        match self.num(key)? {
            Some(v) if v >= 0.0 && v.fract() == 0.0 => Ok(v as usize),
            Some(v) => Err(format!("{key}={v} is not a count")),
            None => Ok(default),
        }
    }
}

#[derive(Debug, Clone)]
struct LineCode {
    phases: Option<usize>,
    z: SequenceImpedance,
    units: Option<String>,
    normamps: f64,
}

#[derive(Debug, Default)]
struct BusEntry {
    name: String,
    phases: BTreeSet<Phase>,
    set_kv: Option<f64>,
    rated_kv: Option<f64>,
    device_kv: Option<f64>,
}

#[derive(Debug, Default, Clone)]
struct Winding {
    bus: Option<String>,
    kv: Option<f64>,
    kva: Option<f64>,
    r: Option<f64>,
}

/// Line-to-neutral kV for an element rated at `kv` with `phases` phases
fn ln_kv(kv: f64, phases: usize) -> f64 {
    if phases > 1 { kv / SQRT_3 } else { kv }
}

struct DssReader {
    param_re: Regex,
    stack: Vec<PathBuf>,
    circuit_seen: bool,
    buses: Vec<BusEntry>,
    bus_lookup: HashMap<String, usize>,
    linecodes: HashMap<String, LineCode>,
    line_links: Vec<(usize, usize)>,
    model: GridModel,
}

impl DssReader {
    fn new() -> Result<Self, DssError> {
        Ok(DssReader {
            param_re: Regex::new(
                r#"(?:([%\w]+)\s*=\s*)?(\[[^\]]*\]|\([^)]*\)|"[^"]*"|'[^']*'|[^\s=\[\]()"']+)"#,
            )?,
            stack: Vec::new(),
            circuit_seen: false,
            buses: Vec::new(),
            bus_lookup: HashMap::new(),
            linecodes: HashMap::new(),
            line_links: Vec::new(),
            model: GridModel::default(),
        })
    }

    fn run_file(&mut self, path: &Path) -> Result<(), DssError> {
        let read_err = |source| DssError::Read {
            path: path.to_path_buf(),
            source,
        };
        let canonical = path.canonicalize().map_err(read_err)?;
        if self.stack.contains(&canonical) {
            return Err(DssError::RedirectCycle(canonical));
        }
        let content = fs::read_to_string(&canonical).map_err(read_err)?;
        let base = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        self.stack.push(canonical.clone());
        let result = self.run_script(&content, &canonical, &base);
        self.stack.pop();
        result
    }

    fn run_script(&mut self, content: &str, origin: &Path, base: &Path) -> Result<(), DssError> {
        for (line, command) in logical_lines(content) {
            let (verb, rest) = command
                .split_once(char::is_whitespace)
                .unwrap_or((command.as_str(), ""));
            let syntax = |message: String| DssError::Syntax {
                path: origin.to_path_buf(),
                line,
                message,
            };

            match verb.to_ascii_lowercase().as_str() {
                "new" => self.new_element(rest).map_err(syntax)?,
                "redirect" | "compile" => {
                    let target = unquote(rest.trim());
                    if target.is_empty() {
                        return Err(syntax(format!("{verb} without a file name")));
                    }
                    self.run_file(&base.join(target))?;
                }
                "setkvbase" => self.set_kv_base(rest).map_err(syntax)?,
                other => debug!(command = other, line, "skipping OpenDSS command"),
            }
        }
        Ok(())
    }

    /// Register a bus reference like `n42.1.2` and return the bus name with
    /// the phases it connects. Without node suffixes the first `phases` nodes are used.
    fn bus_ref(&mut self, spec: &str, phases: usize) -> (String, Vec<Phase>) {
        let mut parts = unquote(spec).split('.');
        let name = parts.next().unwrap_or_default().to_ascii_lowercase();
        let nodes: Vec<u32> = parts.filter_map(|p| p.parse().ok()).collect();
        let connected: Vec<Phase> = if nodes.is_empty() {
            (1..=phases.min(3) as u32).filter_map(node_phase).collect()
        } else {
            nodes.into_iter().filter_map(node_phase).collect()
        };

        let idx = match self.bus_lookup.get(&name) {
            Some(&idx) => idx,
            None => {
                self.buses.push(BusEntry {
                    name: name.clone(),
                    ..Default::default()
                });
                self.bus_lookup.insert(name.clone(), self.buses.len() - 1);
                self.buses.len() - 1
            }
        };
        self.buses[idx].phases.extend(connected.iter().copied());
        (name, connected)
    }

    fn bus_entry(&mut self, name: &str) -> &mut BusEntry {
        let idx = self.bus_lookup[name];
        &mut self.buses[idx]
    }

    fn set_kv_base(&mut self, rest: &str) -> Result<(), String> {
        let params = Params::parse(&self.param_re, rest);
        let bus = params.get("bus").ok_or("SetKVBase without bus=")?;
        let kv = match (params.num("kvll")?, params.num("kvln")?) {
            (_, Some(ln)) => ln,
            (Some(ll), None) => ll / SQRT_3,
            (None, None) => return Err("SetKVBase needs kvll= or kvln=".to_string()),
        };
        let name = unquote(bus)
            .split('.')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match self.bus_lookup.get(&name) {
            Some(&idx) => self.buses[idx].set_kv = Some(kv),
            None => warn!(bus = %name, "SetKVBase names a bus no element uses, ignored"),
        }
        Ok(())
    }

    fn new_element(&mut self, rest: &str) -> Result<(), String> {
        let mut params = Params::parse(&self.param_re, rest);
        if params.items.is_empty() {
            return Err("New without an object".to_string());
        }
        let (key, object) = params.items.remove(0);
        if key.as_deref().is_some_and(|k| k != "object") {
            return Err(format!("expected Class.name, found {}=", key.unwrap_or_default()));
        }
        let object = unquote(&object).to_ascii_lowercase();
        let (class, name) = object
            .split_once('.')
            .ok_or_else(|| format!("'{object}' is not Class.name"))?;

        match class {
            "circuit" | "vsource" => {
                self.circuit_seen |= class == "circuit";
                self.source(name, &params)
            }
            "linecode" => self.linecode(name, &params),
            "line" => self.line(name, &params),
            "transformer" => self.transformer(name, &params),
            "load" => self.load(name, &params),
            "pvsystem" => self.pvsystem(name, &params),
            "capacitor" => self.capacitor(name, &params),
            other => {
                debug!(class = other, name, "skipping OpenDSS element");
                Ok(())
            }
        }
    }

    fn source(&mut self, name: &str, params: &Params) -> Result<(), String> {
        let phases = params.count_or("phases", 3)?;
        let kv = params.num_or("basekv", DEFAULT_SOURCE_KV)?;
        let (bus, _) = self.bus_ref(params.get("bus1").unwrap_or("sourcebus"), phases);
        self.bus_entry(&bus).rated_kv = Some(ln_kv(kv, phases));
        self.model.sources.push(VoltageSource {
            name: name.to_string(),
            bus,
        });
        Ok(())
    }

    fn linecode(&mut self, name: &str, params: &Params) -> Result<(), String> {
        let mut z = DEFAULT_LINE_Z;
        if let (Some(r), Some(x)) = (params.nums("rmatrix")?, params.nums("xmatrix")?) {
            let bad = || format!("linecode {name}: matrix is not 1x1, 2x2 or 3x3");
            (z.r0, z.r1) = sequence_from_matrix(&r).ok_or_else(bad)?;
            (z.x0, z.x1) = sequence_from_matrix(&x).ok_or_else(bad)?;
        }
        z.r1 = params.num_or("r1", z.r1)?;
        z.x1 = params.num_or("x1", z.x1)?;
        z.r0 = params.num_or("r0", z.r0)?;
        z.x0 = params.num_or("x0", z.x0)?;

        let phases = params.num("nphases")?.map(|n| n as usize);
        self.linecodes.insert(
            name.to_string(),
            LineCode {
                phases,
                z,
                units: params.get("units").map(str::to_string),
                normamps: params.num_or("normamps", DEFAULT_NORMAMPS)?,
            },
        );
        Ok(())
    }

    fn line(&mut self, name: &str, params: &Params) -> Result<(), String> {
        let code = match params.get("linecode") {
            Some(code) => {
                let key = unquote(code).to_ascii_lowercase();
                Some(
                    self.linecodes
                        .get(&key)
                        .cloned()
                        .ok_or_else(|| format!("line {name}: unknown linecode '{key}'"))?,
                )
            }
            None => None,
        };

        let phases = params.count_or("phases", code.as_ref().and_then(|c| c.phases).unwrap_or(3))?;
        let bus1 = params.get("bus1").ok_or_else(|| format!("line {name}: missing bus1"))?;
        let bus2 = params.get("bus2").ok_or_else(|| format!("line {name}: missing bus2"))?;
        let (from_bus, from_phases) = self.bus_ref(bus1, phases);
        let (to_bus, _) = self.bus_ref(bus2, phases);

        let line_units = params.get("units").unwrap_or("none");
        let length = params.num_or("length", 1.0)?;
        let length_miles = length * miles_per_unit(line_units)?;

        // per-unit impedances refer to the line code's units when it names them
        let z_units = code
            .as_ref()
            .and_then(|c| c.units.clone())
            .unwrap_or_else(|| line_units.to_string());
        let base = code.as_ref().map_or(DEFAULT_LINE_Z, |c| c.z);
        let per_mile = miles_per_unit(&z_units)?;
        let impedance = SequenceImpedance {
            r0: params.num_or("r0", base.r0)? / per_mile,
            r1: params.num_or("r1", base.r1)? / per_mile,
            x0: params.num_or("x0", base.x0)? / per_mile,
            x1: params.num_or("x1", base.x1)? / per_mile,
        };

        let mut line_phases: Vec<Phase> = from_phases.into_iter().filter(|p| *p != Phase::N).collect();
        if line_phases.is_empty() {
            line_phases = (1..=phases.min(3) as u32).filter_map(node_phase).collect();
        }

        let from = self.bus_lookup[&from_bus];
        let to = self.bus_lookup[&to_bus];
        self.line_links.push((from, to));
        self.model.lines.push(Line {
            name: name.to_string(),
            from_bus,
            to_bus,
            phases: line_phases,
            length_miles,
            ampacity_a: params.num_or(
                "normamps",
                code.as_ref().map_or(DEFAULT_NORMAMPS, |c| c.normamps),
            )?,
            impedance: Some(impedance),
        });
        Ok(())
    }

    fn transformer(&mut self, name: &str, params: &Params) -> Result<(), String> {
        let mut phases = 3;
        let mut windings = vec![Winding::default(); 2];
        let mut active = 0;
        let mut xhl = DEFAULT_XFMR_XHL;

        for (key, value) in &params.items {
            let Some(key) = key.as_deref() else { continue };
            let list = || split_list(value);
            match key {
                "phases" => phases = parse_num(key, value)? as usize,
                "windings" => {
                    let n = parse_num(key, value)? as usize;
                    windings.resize(n.max(2), Winding::default());
                }
                "wdg" => {
                    active = (parse_num(key, value)? as usize).saturating_sub(1);
                    if active >= windings.len() {
                        windings.resize(active + 1, Winding::default());
                    }
                }
                "bus" => windings[active].bus = Some(value.clone()),
                "kv" => windings[active].kv = Some(parse_num(key, value)?),
                "kva" => windings[active].kva = Some(parse_num(key, value)?),
                "%r" => windings[active].r = Some(parse_num(key, value)?),
                "buses" | "kvs" | "kvas" | "%rs" => {
                    let items = list();
                    if items.len() > windings.len() {
                        windings.resize(items.len(), Winding::default());
                    }
                    for (w, item) in windings.iter_mut().zip(items) {
                        match key {
                            "buses" => w.bus = Some(item.to_string()),
                            "kvs" => w.kv = Some(parse_num(key, item)?),
                            "kvas" => w.kva = Some(parse_num(key, item)?),
                            _ => w.r = Some(parse_num(key, item)?),
                        }
                    }
                }
                "xhl" | "x12" => xhl = parse_num(key, value)?,
                _ => {}
            }
        }

        let mut names = Vec::with_capacity(windings.len());
        for (i, w) in windings.iter().enumerate() {
            let spec = w
                .bus
                .as_deref()
                .ok_or_else(|| format!("transformer {name}: winding {} has no bus", i + 1))?;
            let (bus, _) = self.bus_ref(spec, phases);
            let kv = w.kv.unwrap_or(DEFAULT_KV);
            let entry = self.bus_entry(&bus);
            entry.rated_kv.get_or_insert(ln_kv(kv, phases));
            names.push(bus);
        }

        let rated_kva = windings[0].kva.unwrap_or(DEFAULT_XFMR_KVA);
        self.model.transformers.push(Transformer {
            name: name.to_string(),
            from_bus: names[0].clone(),
            to_bus: names[1].clone(),
            num_phases: phases,
            rated_kva,
            r_percent: windings[0].r.unwrap_or(DEFAULT_XFMR_R),
            xhl_percent: xhl,
        });
        Ok(())
    }

    /// Bus of a single-terminal device; records its rated kV as a last-resort base
    fn device_bus(&mut self, name: &str, params: &Params) -> Result<String, String> {
        let phases = params.count_or("phases", 3)?;
        let spec = params
            .get("bus1")
            .ok_or_else(|| format!("{name}: missing bus1"))?;
        let (bus, _) = self.bus_ref(spec, phases);
        let kv = ln_kv(params.num_or("kv", DEFAULT_KV)?, phases);
        self.bus_entry(&bus).device_kv.get_or_insert(kv);
        Ok(bus)
    }

    fn load(&mut self, name: &str, params: &Params) -> Result<(), String> {
        let bus = self.device_bus(name, params)?;
        let kw = params.num_or("kw", DEFAULT_LOAD_KW)?;
        let kvar = match params.num("kvar")? {
            Some(kvar) => kvar,
            None => {
                let pf = params.num_or("pf", DEFAULT_LOAD_PF)?;
                if pf == 0.0 {
                    return Err(format!("load {name}: pf=0"));
                }
                kw * pf.abs().acos().tan() * pf.signum()
            }
        };
        self.model.loads.push(Load {
            name: name.to_string(),
            bus,
            active_kw: kw,
            reactive_kvar: kvar,
        });
        Ok(())
    }

    fn pvsystem(&mut self, name: &str, params: &Params) -> Result<(), String> {
        let bus = self.device_bus(name, params)?;
        self.model.solars.push(Solar {
            name: name.to_string(),
            bus,
            rated_kw: params.num_or("pmpp", DEFAULT_PMPP)?,
        });
        Ok(())
    }

    fn capacitor(&mut self, name: &str, params: &Params) -> Result<(), String> {
        let bus = self.device_bus(name, params)?;
        let kvar = params
            .nums("kvar")?
            .map_or(DEFAULT_CAP_KVAR, |steps| steps.iter().sum());
        self.model.capacitors.push(Capacitor {
            name: name.to_string(),
            bus,
            rated_kvar: kvar,
        });
        Ok(())
    }

    /// Fill unknown bases from known neighbours across lines.
    fn spread_kv(&self, kv: &mut [Option<f64>]) {
        let mut adjacency = vec![Vec::new(); kv.len()];
        for &(a, b) in &self.line_links {
            adjacency[a].push(b);
            adjacency[b].push(a);
        }
        let mut queue: VecDeque<usize> = (0..kv.len()).filter(|&i| kv[i].is_some()).collect();
        while let Some(bus) = queue.pop_front() {
            for &next in &adjacency[bus] {
                if kv[next].is_none() {
                    kv[next] = kv[bus];
                    queue.push_back(next);
                }
            }
        }
    }

    fn finish(mut self, name: String) -> Result<GridModel, DssError> {
        if !self.circuit_seen {
            return Err(DssError::NoCircuit);
        }

        let mut kv: Vec<Option<f64>> = self
            .buses
            .iter()
            .map(|b| b.set_kv.or(b.rated_kv))
            .collect();
        self.spread_kv(&mut kv);
        for (slot, bus) in kv.iter_mut().zip(&self.buses) {
            if slot.is_none() {
                *slot = bus.device_kv;
            }
        }
        self.spread_kv(&mut kv);

        self.model.name = name;
        self.model.buses = self
            .buses
            .into_iter()
            .zip(kv)
            .map(|(entry, kv)| Bus {
                name: entry.name,
                phases: entry.phases.into_iter().collect(),
                nominal_voltage_kv: kv.unwrap_or(0.0),
            })
            .collect();
        Ok(self.model)
    }
}

/// Script lines with comments removed and `~` continuations joined, each
/// tagged with the line number it starts on.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    let mut in_block = false;

    for (i, raw) in content.lines().enumerate() {
        let mut kept = String::new();
        let mut rest = raw;
        loop {
            if in_block {
                match rest.find("*/") {
                    Some(end) => {
                        rest = &rest[end + 2..];
                        in_block = false;
                    }
                    None => break,
                }
                continue;
            }
            let line_comment = rest.find('!').into_iter().chain(rest.find("//")).min();
            match (rest.find("/*"), line_comment) {
                (Some(start), Some(cut)) if cut < start => {
                    kept.push_str(&rest[..cut]);
                    break;
                }
                (Some(start), _) => {
                    kept.push_str(&rest[..start]);
                    rest = &rest[start + 2..];
                    in_block = true;
                }
                (None, Some(cut)) => {
                    kept.push_str(&rest[..cut]);
                    break;
                }
                (None, None) => {
                    kept.push_str(rest);
                    break;
                }
            }
        }
        let text = kept.trim();
        if text.is_empty() {
            continue;
        }

        let continuation = text
            .strip_prefix('~')
            .or_else(|| {
                text.get(..5)
                    .filter(|head| head.eq_ignore_ascii_case("more "))
                    .map(|_| &text[5..])
            });
        match (continuation, lines.last_mut()) {
            (Some(rest), Some((_, last))) => {
                last.push(' ');
                last.push_str(rest.trim());
            }
            _ => lines.push((i + 1, text.to_string())),
        }
    }
    lines
}
