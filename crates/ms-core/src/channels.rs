//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Per-element process-variable routes over the live lattice."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::sync::Arc;

use ms_router::{ChannelError, ChannelRouter, ChannelValue, Route, RouterError, SemanticType};
use tracing::debug;

use crate::adapter::SharedModel;
use crate::publisher::TableChannel;

/// Read-only per-element fields and the table column each one reads.
#[rustfmt::skip]
pub const ELEMENT_FIELDS: [(&str, &str); 13] = [
    ("S", "s"), ("LENGTH", "length"), ("P0C", "p0c"),
    ("ALPHA_X", "alpha_x"), ("BETA_X", "beta_x"), ("ETA_X", "eta_x"),
    ("ETAP_X", "etap_x"), ("PSI_X", "psi_x"),
    ("ALPHA_Y", "alpha_y"), ("BETA_Y", "beta_y"), ("ETA_Y", "eta_y"),
    ("ETAP_Y", "etap_y"), ("PSI_Y", "psi_y"),
];

/// Writable per-element settings and the engine attribute behind each.
pub const ELEMENT_SETTINGS: [(&str, &str); 2] = [("K1", "k1"), ("KICK", "kick")];

/// Element segment of a channel name; engine selectors such as globs never route.
const ELEMENT_SEGMENT: &str = "[A-Za-z0-9_#.]+";

/// Split `{prefix}:{ELEMENT}:{FIELD}` into element and field.
fn split_name<'a>(prefix: &str, name: &'a str) -> Result<(&'a str, &'a str), ChannelError> {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(|rest| rest.rsplit_once(':'))
        .ok_or_else(|| ChannelError::Handler(format!("'{name}' is not an element channel")))
}

fn alternatives(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(suffix, _)| *suffix)
        .collect::<Vec<_>>()
        .join("|")
}

/// Register element routes under `prefix` on `router`.
///
/// Field channels read the live table. Setting channels read and write the
/// model through the adapter, so a write marks the model changed.
pub fn register_lattice_routes(
    router: &ChannelRouter,
    prefix: &str,
    tables: Arc<TableChannel>,
    model: SharedModel,
) -> Result<(), RouterError> {
    let escaped = regex::escape(prefix);

    let field_prefix = prefix.to_owned();
    let field_tables = Arc::clone(&tables);
    let field_route = Route::new(
        &format!("{escaped}:{ELEMENT_SEGMENT}:(?:{})$", alternatives(&ELEMENT_FIELDS)),
        SemanticType::Double,
        Arc::new(move |name| {
            let (element, field) = split_name(&field_prefix, name)?;
            let column = ELEMENT_FIELDS
                .iter()
                .find(|(suffix, _)| *suffix == field)
                .map(|(_, column)| *column)
                .ok_or_else(|| ChannelError::Handler(format!("unknown field '{field}'")))?;
            let table = field_tables.live();
            table
                .row(element)
                .and_then(|row| row.value(column))
                .map(ChannelValue::Double)
                .ok_or_else(|| ChannelError::Handler(format!("no element '{element}' in the live table")))
        }),
    )?;
    router.add_route(field_route);

    let get_prefix = prefix.to_owned();
    let set_prefix = prefix.to_owned();
    let get_model = Arc::clone(&model);
    let set_model = model;
    let get_tables = Arc::clone(&tables);
    let set_tables = tables;
    let setting_route = Route::new(
        &format!("{escaped}:{ELEMENT_SEGMENT}:(?:{})$", alternatives(&ELEMENT_SETTINGS)),
        SemanticType::Double,
        Arc::new(move |name| {
            let (element, attr) = setting(&get_prefix, name)?;
            ensure_live_element(&get_tables, element)?;
            let query = format!("python lat_list 1@0>>{element}|model real:ele.{attr}");
            let values = get_model
                .lock()
                .command_real(&query)
                .map_err(|err| ChannelError::Handler(err.to_string()))?;
            values
                .first()
                .copied()
                .map(ChannelValue::Double)
                .ok_or_else(|| ChannelError::Handler(format!("no value for '{name}'")))
        }),
    )?
    .with_setter(Arc::new(move |name, value| {
        let (element, attr) = setting(&set_prefix, name)?;
        ensure_live_element(&set_tables, element)?;
        let value = value
            .as_f64()
            .ok_or_else(|| ChannelError::Handler("setting expects a number".into()))?;
        let command = format!("set ele {element} {attr} = {value}");
        debug!(channel = name, command = %command, "applying channel write");
        set_model
            .lock()
            .command(&command)
            .map(|_| ())
            .map_err(|err| ChannelError::Handler(err.to_string()))
    }));
    router.add_route(setting_route);
    Ok(())
}

fn ensure_live_element(tables: &TableChannel, element: &str) -> Result<(), ChannelError> {
    if tables.live().row(element).is_some() {
        Ok(())
    } else {
        Err(ChannelError::Handler(format!("no element '{element}' in the live table")))
    }
}

fn setting<'a>(prefix: &str, name: &'a str) -> Result<(&'a str, &'static str), ChannelError> {
    let (element, suffix) = split_name(prefix, name)?;
    ELEMENT_SETTINGS
        .iter()
        .find(|(s, _)| *s == suffix)
        .map(|(_, attr)| (element, *attr))
        .ok_or_else(|| ChannelError::Handler(format!("unknown setting '{suffix}'")))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ms_common::PublishConfig;
    use ms_oracle::ScriptedOracle;

    use super::*;
    use crate::adapter::ModelAdapter;
    use crate::flags::ChangeTracker;
    use crate::table::{LatticeElementRecord, PlaneOptics, TwissTable};

    fn table() -> TwissTable {
        let plane = PlaneOptics { alpha: 0.5, beta: 7.0, eta: 0.0, etap: 0.0, psi: 1.0 };
        TwissTable {
            rows: vec![LatticeElementRecord {
                element: "QF01".into(),
                device_name: String::new(),
                s: 0.1,
                length: 0.1,
                p0c: 135e6,
                x: plane,
                y: PlaneOptics { beta: 3.0, ..plane },
                rmat: [[0.0; 6]; 6],
            }],
            built_at: Utc::now(),
        }
    }

    fn setup(oracle: ScriptedOracle) -> (ChannelRouter, Arc<ChangeTracker>) {
        let tracker = Arc::new(ChangeTracker::new());
        let model = ModelAdapter::new(Box::new(oracle), Arc::clone(&tracker)).into_shared();
        let tables = Arc::new(TableChannel::new(Arc::new(table()), &PublishConfig::default()));
        let router = ChannelRouter::new();
        register_lattice_routes(&router, "BMAD:SYS0:1", tables, model).expect("routes");
        (router, tracker)
    }

    #[test]
    fn field_channels_read_the_live_table() {
        let (router, _) = setup(ScriptedOracle::new());
        let beta_y = router.get("BMAD:SYS0:1:QF01:BETA_Y").expect("channel");
        assert_eq!(beta_y.read(), Ok(ChannelValue::Double(3.0)));
        assert!(!beta_y.is_writable());
        assert!(matches!(
            router.get("BMAD:SYS0:1:QD09:BETA_X").expect("channel").read(),
            Err(ChannelError::Handler(_))
        ));
        assert!(!router.contains("BMAD:SYS0:1:QF01:BETA_Z"));
        assert!(!router.contains("OTHER:QF01:BETA_X"));
    }

    #[test]
    fn setting_channels_go_through_the_model() {
        let oracle = ScriptedOracle::new()
            .respond_real("python lat_list 1@0>>QF01|model real:ele.k1", vec![1.5])
            .respond("set ele QF01 k1 = 2", Vec::<String>::new());
        let log = oracle.log();
        let (router, tracker) = setup(oracle);

        let k1 = router.get("BMAD:SYS0:1:QF01:K1").expect("channel");
        assert_eq!(k1.read(), Ok(ChannelValue::Double(1.5)));
        k1.write(ChannelValue::Double(2.0)).expect("write");
        assert!(tracker.needs_table_refresh());
        assert_eq!(log.lock().last().map(String::as_str), Some("set ele QF01 k1 = 2"));
    }

    #[test]
    fn setting_channels_address_one_live_element() {
        let oracle = ScriptedOracle::new();
        let log = oracle.log();
        let (router, tracker) = setup(oracle);

        assert!(router.get("BMAD:SYS0:1:Q*:K1").is_err());
        assert!(router.get("BMAD:SYS0:1:QF01 k1 = 9 junk:K1").is_err());

        let missing = router.get("BMAD:SYS0:1:QD09:K1").expect("channel");
        assert!(matches!(missing.read(), Err(ChannelError::Handler(_))));
        assert!(matches!(
            missing.write(ChannelValue::Double(0.7)),
            Err(ChannelError::Handler(_))
        ));
        assert!(log.lock().is_empty());
        assert!(!tracker.needs_table_refresh());
    }
}
