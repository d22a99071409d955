//! ---
//! ms_section: "11-simulation"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Physics oracle interface and bundled engines."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! In-process FODO beamline answering the engine command subset used by the
//! model service.
//!
//! Supported commands:
//!
//! * `python lat_ele 1@0`
//! * `python lat_list 1@0>>{selector}|{model|design} real:ele.{attr}`
//! * `python ele:mat6 1@0>>{index}|{model|design} mat6`
//! * `show data orbit.{x|y|profx|profy}`
//! * `show lat [-no_label_lines] [-at column]... [selector[,selector]...]`
//! * `set ele {selector} {k1|kick|hkick|vkick} = {value}`
//!
//! Selectors are `*`, an element index, a name glob (`QF*`) or a
//! `Class::glob` pair (`Instrument::OTR*`).

use globset::{GlobBuilder, GlobMatcher};
use ms_common::config::SimulatorConfig;
use tracing::debug;

use crate::optics::{self, Mat6, PlaneTwiss};
use crate::{parse_reals, Oracle, OracleError, Result};

/// Element classes known to the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Beginning,
    Marker,
    Drift,
    Quadrupole,
    HKicker,
    VKicker,
    Monitor,
    Instrument,
    /// Lord element listed after `END`; not part of tracking.
    Overlay,
}

impl ElementKind {
    /// Class key as used in `Class::name` selectors.
    pub fn key(&self) -> &'static str {
        match self {
            ElementKind::Beginning => "Beginning_Ele",
            ElementKind::Marker => "Marker",
            ElementKind::Drift => "Drift",
            ElementKind::Quadrupole => "Quadrupole",
            ElementKind::HKicker => "HKicker",
            ElementKind::VKicker => "VKicker",
            ElementKind::Monitor => "Monitor",
            ElementKind::Instrument => "Instrument",
            ElementKind::Overlay => "Overlay",
        }
    }
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    kind: ElementKind,
    length: f64,
    k1: f64,
    kick: f64,
}

impl Element {
    fn new(name: impl Into<String>, kind: ElementKind, length: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            length,
            k1: 0.0,
            kick: 0.0,
        }
    }

    fn quadrupole(name: impl Into<String>, length: f64, k1: f64) -> Self {
        Self {
            k1,
            ..Self::new(name, ElementKind::Quadrupole, length)
        }
    }

    fn transfer_matrix(&self) -> Mat6 {
        match self.kind {
            ElementKind::Quadrupole => optics::quadrupole(self.length, self.k1),
            ElementKind::Beginning | ElementKind::Overlay => optics::identity(),
            _ if self.length > 0.0 => optics::drift(self.length),
            _ => optics::identity(),
        }
    }
}

/// Optics at the exit of one tracking element.
#[derive(Debug, Clone)]
struct ElementOptics {
    s: f64,
    a: PlaneTwiss,
    b: PlaneTwiss,
    orbit: [f64; 6],
    mat6: Mat6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lattice {
    Model,
    Design,
}

/// FODO beamline simulator implementing [`Oracle`].
#[derive(Debug, Clone)]
pub struct LatticeSimulator {
    elements: Vec<Element>,
    end_index: usize,
    p0c: f64,
    start: (PlaneTwiss, PlaneTwiss),
    model: Vec<ElementOptics>,
    design: Vec<ElementOptics>,
}

impl LatticeSimulator {
    /// Build the beamline described by `config` and compute design optics.
    ///
    /// Each cell is `QF BPM (OTR|YAG) XC D QD YC D`; the line closes with
    /// `UNDSTART DUND BPMUND END` followed by two overlay lords.
    pub fn new(config: &SimulatorConfig) -> Self {
        let mut elements = vec![Element::new("BEGINNING", ElementKind::Beginning, 0.0)];
        for cell in 1..=config.cells {
            let profile = if cell % 2 == 1 { "OTR" } else { "YAG" };
            elements.push(Element::quadrupole(
                format!("QF{cell:02}"),
                config.quad_length,
                config.quad_k1,
            ));
            elements.push(Element::new(format!("BPM{cell:02}"), ElementKind::Monitor, 0.0));
            elements.push(Element::new(
                format!("{profile}{cell:02}"),
                ElementKind::Instrument,
                0.0,
            ));
            elements.push(Element::new(format!("XC{cell:02}"), ElementKind::HKicker, 0.0));
            elements.push(Element::new(
                format!("D{cell:02}A"),
                ElementKind::Drift,
                config.drift_length,
            ));
            elements.push(Element::quadrupole(
                format!("QD{cell:02}"),
                config.quad_length,
                -config.quad_k1,
            ));
            elements.push(Element::new(format!("YC{cell:02}"), ElementKind::VKicker, 0.0));
            elements.push(Element::new(
                format!("D{cell:02}B"),
                ElementKind::Drift,
                config.drift_length,
            ));
        }
        elements.push(Element::new("UNDSTART", ElementKind::Marker, 0.0));
        elements.push(Element::new("DUND", ElementKind::Drift, config.drift_length));
        elements.push(Element::new("BPMUND", ElementKind::Monitor, 0.0));
        elements.push(Element::new("END", ElementKind::Marker, 0.0));
        let end_index = elements.len() - 1;
        elements.push(Element::new("QF_FAMILY", ElementKind::Overlay, 0.0));
        elements.push(Element::new("QD_FAMILY", ElementKind::Overlay, 0.0));

        let start = (
            PlaneTwiss::initial(config.beta_a, config.alpha_a),
            PlaneTwiss::initial(config.beta_b, config.alpha_b),
        );
        let design = compute_optics(&elements[..=end_index], start);
        Self {
            model: design.clone(),
            design,
            elements,
            end_index,
            p0c: config.p0c,
            start,
        }
    }

    /// Number of elements including `BEGINNING` and the lords after `END`.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Always false; a beamline has at least `BEGINNING` and `END`.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Index of the `END` marker.
    pub fn end_index(&self) -> usize {
        self.end_index
    }

    /// Element names in lattice order.
    pub fn element_names(&self) -> impl Iterator<Item = &str> {
        self.elements.iter().map(|e| e.name.as_str())
    }

    /// Class of the element called `name`, if present.
    pub fn kind_of(&self, name: &str) -> Option<ElementKind> {
        self.elements
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.kind)
    }

    fn recompute(&mut self) {
        self.model = compute_optics(&self.elements[..=self.end_index], self.start);
    }

    fn optics(&self, lattice: Lattice) -> &[ElementOptics] {
        match lattice {
            Lattice::Model => &self.model,
            Lattice::Design => &self.design,
        }
    }

    /// Element indices matched by one selector; empty when nothing matches.
    fn matching(&self, selector: &str) -> Result<Vec<usize>> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(OracleError::InvalidArgument("empty element selector".into()));
        }
        if selector == "*" {
            return Ok((1..=self.end_index).collect());
        }
        if let Ok(index) = selector.parse::<usize>() {
            return Ok(if index < self.elements.len() {
                vec![index]
            } else {
                Vec::new()
            });
        }
        let (class, pattern) = match selector.split_once("::") {
            Some((class, pattern)) => (Some(class), pattern),
            None => (None, selector),
        };
        let matcher = name_matcher(pattern)?;
        Ok((1..=self.end_index)
            .filter(|&i| {
                let element = &self.elements[i];
                class.map_or(true, |c| element.kind.key().eq_ignore_ascii_case(c))
                    && matcher.is_match(&element.name)
            })
            .collect())
    }

    fn select(&self, selector: &str) -> Result<Vec<usize>> {
        let found = self.matching(selector)?;
        if found.is_empty() {
            return Err(OracleError::UnknownElement(selector.trim().to_owned()));
        }
        Ok(found)
    }

    fn tracking_optics(&self, index: usize, lattice: Lattice) -> Result<&ElementOptics> {
        self.optics(lattice).get(index).ok_or_else(|| {
            OracleError::Engine(format!(
                "element {} is not a tracking element",
                self.elements[index].name
            ))
        })
    }

    fn attribute(&self, index: usize, attr: &str, lattice: Lattice) -> Result<f64> {
        let element = &self.elements[index];
        match attr {
            "l" => return Ok(element.length),
            "k1" => return Ok(element.k1),
            "kick" => return Ok(element.kick),
            "p0c" => return Ok(self.p0c),
            _ => {}
        }
        let optics = self.tracking_optics(index, lattice)?;
        let value = match attr {
            "s" => optics.s,
            "a.alpha" => optics.a.alpha,
            "a.beta" => optics.a.beta,
            "a.eta" => optics.a.eta,
            "a.etap" => optics.a.etap,
            "a.phi" => optics.a.phi,
            "b.alpha" => optics.b.alpha,
            "b.beta" => optics.b.beta,
            "b.eta" => optics.b.eta,
            "b.etap" => optics.b.etap,
            "b.phi" => optics.b.phi,
            other => match other.strip_prefix("orbit.vec.") {
                Some(n) => {
                    let component = n
                        .parse::<usize>()
                        .ok()
                        .filter(|c| (1..=6).contains(c))
                        .ok_or_else(|| OracleError::InvalidArgument(format!("bad attribute {other}")))?;
                    optics.orbit[component - 1]
                }
                None => {
                    return Err(OracleError::InvalidArgument(format!(
                        "unknown element attribute '{other}'"
                    )))
                }
            },
        };
        Ok(value)
    }

    fn python(&mut self, args: &str) -> Result<Vec<String>> {
        let (sub, rest) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
        match sub {
            "lat_ele" => Ok(self
                .elements
                .iter()
                .enumerate()
                .map(|(i, e)| format!("{};{}", i, e.name))
                .collect()),
            "lat_list" => Ok(self
                .lat_list(rest)?
                .iter()
                .map(|v| format!("{v:.15e}"))
                .collect()),
            "ele:mat6" => self.mat6(rest),
            other => Err(OracleError::UnknownCommand(format!("python {other}"))),
        }
    }

    fn lat_list(&self, args: &str) -> Result<Vec<f64>> {
        let (target, what) = args
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| OracleError::InvalidArgument(format!("lat_list expects target and attribute: '{}'", args.trim())))?;
        let what = what.trim();
        let what = what.strip_prefix("real:").unwrap_or(what);
        let attr = what
            .strip_prefix("ele.")
            .ok_or_else(|| OracleError::InvalidArgument(format!("unsupported lat_list quantity '{what}'")))?;
        let (selector, lattice) = parse_target(target)?;
        self.select(selector)?
            .into_iter()
            .map(|i| self.attribute(i, attr, lattice))
            .collect()
    }

    fn mat6(&self, args: &str) -> Result<Vec<String>> {
        let mut parts = args.split_whitespace();
        let target = parts
            .next()
            .ok_or_else(|| OracleError::InvalidArgument("ele:mat6 expects a target".into()))?;
        match parts.next() {
            Some("mat6") | None => {}
            Some(other) => {
                return Err(OracleError::InvalidArgument(format!(
                    "unsupported ele:mat6 output '{other}'"
                )))
            }
        }
        let (selector, lattice) = parse_target(target)?;
        let indices = self.select(selector)?;
        let [index] = indices.as_slice() else {
            return Err(OracleError::InvalidArgument(format!(
                "ele:mat6 needs exactly one element, '{selector}' matched {}",
                indices.len()
            )));
        };
        let optics = self.tracking_optics(*index, lattice)?;
        Ok(optics
            .mat6
            .iter()
            .enumerate()
            .map(|(row, values)| {
                let fields: Vec<String> = values.iter().map(|v| format!("{v:.15e}")).collect();
                format!("{};REAL_ARR;F;{}", row + 1, fields.join(";"))
            })
            .collect())
    }

    fn show(&self, args: &str) -> Result<Vec<String>> {
        let mut tokens = args.split_whitespace();
        match tokens.next() {
            Some("data") => {
                let datum = tokens
                    .next()
                    .ok_or_else(|| OracleError::InvalidArgument("show data expects a datum".into()))?;
                self.show_data(datum)
            }
            Some("lat") => self.show_lat(tokens.collect()),
            Some(other) => Err(OracleError::UnknownCommand(format!("show {other}"))),
            None => Err(OracleError::InvalidArgument("show expects a topic".into())),
        }
    }

    fn show_data(&self, datum: &str) -> Result<Vec<String>> {
        let (kind, component) = match datum {
            "orbit.x" => (ElementKind::Monitor, 0),
            "orbit.y" => (ElementKind::Monitor, 2),
            "orbit.profx" => (ElementKind::Instrument, 0),
            "orbit.profy" => (ElementKind::Instrument, 2),
            other => return Err(OracleError::InvalidArgument(format!("no data named '{other}'"))),
        };
        let mut lines = vec![
            format!("  Data name: {datum}"),
            "  Ix  Ele_name  Useit  Meas  Ref  Model  Design".to_owned(),
            "  ------------------------------------------------".to_owned(),
        ];
        let mut count = 0usize;
        for i in 1..=self.end_index {
            if self.elements[i].kind != kind {
                continue;
            }
            count += 1;
            lines.push(format!(
                "{:>5} {:<12} {:>5} {:>15.8e} {:>15.8e} {:>15.8e} {:>15.8e}",
                count,
                self.elements[i].name,
                "T",
                0.0,
                0.0,
                self.model[i].orbit[component],
                self.design[i].orbit[component],
            ));
        }
        lines.push("  ------------------------------------------------".to_owned());
        lines.push(format!("  Number of data: {count}"));
        Ok(lines)
    }

    fn show_lat(&self, tokens: Vec<&str>) -> Result<Vec<String>> {
        let mut labels = true;
        let mut columns: Vec<&str> = Vec::new();
        let mut selectors: Vec<&str> = Vec::new();
        let mut iter = tokens.into_iter();
        while let Some(token) = iter.next() {
            match token {
                "-no_label_lines" => labels = false,
                "-at" => columns.push(
                    iter.next()
                        .ok_or_else(|| OracleError::InvalidArgument("-at expects a column".into()))?,
                ),
                switch if switch.starts_with('-') => {
                    return Err(OracleError::InvalidArgument(format!("unknown switch {switch}")))
                }
                selector => selectors.extend(selector.split(',').filter(|s| !s.is_empty())),
            }
        }
        if columns.is_empty() {
            columns = vec!["s", "l", "beta_a", "beta_b"];
        }
        if selectors.is_empty() {
            selectors.push("*");
        }

        let mut indices = Vec::new();
        for selector in &selectors {
            indices.extend(self.matching(selector)?);
        }
        indices.sort_unstable();
        indices.dedup();
        if indices.is_empty() {
            return Err(OracleError::UnknownElement(selectors.join(",")));
        }

        let mut lines = Vec::with_capacity(indices.len() + 1);
        if labels {
            let header: Vec<String> = columns.iter().map(|c| format!("{c:>15}")).collect();
            lines.push(format!("# {:>5} {:<12} {}", "Index", "Name", header.join(" ")));
        }
        for index in indices {
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                let value = self.attribute(index, &column_attribute(column)?, Lattice::Model)?;
                values.push(format!("{value:>15.8e}"));
            }
            lines.push(format!(
                "{:>7} {:<12} {}",
                index,
                self.elements[index].name,
                values.join(" ")
            ));
        }
        Ok(lines)
    }

    fn set(&mut self, args: &str) -> Result<Vec<String>> {
        let args = args.trim();
        let (target, rest) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
        match target {
            "ele" => {}
            "" => return Err(OracleError::InvalidArgument("set expects a target".into())),
            other => return Err(OracleError::UnknownCommand(format!("set {other}"))),
        }
        let (selector, assignment) = rest
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| OracleError::InvalidArgument(format!("malformed set: '{args}'")))?;
        let (attr, value) = assignment
            .split_once('=')
            .ok_or_else(|| OracleError::InvalidArgument(format!("malformed set: '{args}'")))?;
        let attr = attr.trim().to_ascii_lowercase();
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| OracleError::InvalidArgument(format!("'{}' is not a number", value.trim())))?;

        let targets = self.select(selector)?;
        for &index in &targets {
            let element = &self.elements[index];
            let settable = matches!(
                (attr.as_str(), element.kind),
                ("k1", ElementKind::Quadrupole)
                    | ("kick" | "hkick", ElementKind::HKicker)
                    | ("kick" | "vkick", ElementKind::VKicker)
            );
            if !settable {
                return Err(OracleError::InvalidArgument(format!(
                    "element {} has no settable attribute '{}'",
                    element.name, attr
                )));
            }
        }
        for &index in &targets {
            let element = &mut self.elements[index];
            if attr == "k1" {
                element.k1 = value;
            } else {
                element.kick = value;
            }
        }
        self.recompute();
        debug!(selector, attr = %attr, value, elements = targets.len(), "lattice updated");
        Ok(Vec::new())
    }
}

impl Oracle for LatticeSimulator {
    fn cmd(&mut self, command: &str) -> Result<Vec<String>> {
        let command = command.trim();
        let (verb, args) = command
            .split_once(char::is_whitespace)
            .unwrap_or((command, ""));
        match verb {
            "python" => self.python(args.trim()),
            "show" => self.show(args),
            "set" => self.set(args),
            "" => Err(OracleError::InvalidArgument("empty command".into())),
            other => Err(OracleError::UnknownCommand(other.to_owned())),
        }
    }

    fn cmd_real(&mut self, command: &str) -> Result<Vec<f64>> {
        let command = command.trim();
        if let Some(rest) = command.strip_prefix("python lat_list ") {
            return self.lat_list(rest);
        }
        let lines = self.cmd(command)?;
        parse_reals(command, &lines)
    }

    fn name(&self) -> &'static str {
        "lattice-simulator"
    }
}

fn compute_optics(elements: &[Element], start: (PlaneTwiss, PlaneTwiss)) -> Vec<ElementOptics> {
    let (mut a, mut b) = start;
    let mut s = 0.0;
    let mut orbit = [0.0; 6];
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        let mat6 = element.transfer_matrix();
        if element.kind != ElementKind::Beginning {
            s += element.length;
            a = a.propagate(&mat6, 0);
            b = b.propagate(&mat6, 2);
            orbit = optics::apply(&mat6, &orbit);
            match element.kind {
                ElementKind::HKicker => orbit[1] += element.kick,
                ElementKind::VKicker => orbit[3] += element.kick,
                _ => {}
            }
        }
        out.push(ElementOptics {
            s,
            a,
            b,
            orbit,
            mat6,
        });
    }
    out
}

/// `1@0>>{selector}|{model|design}` → selector and lattice.
fn parse_target(target: &str) -> Result<(&str, Lattice)> {
    let (_, after) = target
        .split_once(">>")
        .ok_or_else(|| OracleError::InvalidArgument(format!("malformed element target '{target}'")))?;
    let (selector, which) = after.split_once('|').unwrap_or((after, "model"));
    let lattice = match which {
        "model" => Lattice::Model,
        "design" | "base" => Lattice::Design,
        other => {
            return Err(OracleError::InvalidArgument(format!(
                "unknown lattice '{other}'"
            )))
        }
    };
    Ok((selector, lattice))
}

fn column_attribute(column: &str) -> Result<String> {
    let attr = match column {
        "s" | "l" | "k1" | "kick" => column.to_owned(),
        "orbit_x" => "orbit.vec.1".to_owned(),
        "orbit_y" => "orbit.vec.3".to_owned(),
        other => {
            if let Some(quantity) = other.strip_suffix("_a") {
                format!("a.{quantity}")
            } else if let Some(quantity) = other.strip_suffix("_b") {
                format!("b.{quantity}")
            } else {
                return Err(OracleError::InvalidArgument(format!("unknown column '{other}'")));
            }
        }
    };
    Ok(attr)
}

/// Case-insensitive element name glob.
fn name_matcher(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|err| {
            OracleError::InvalidArgument(format!("bad element pattern '{pattern}': {err}"))
        })
}
