//! Lua 5.4 VM helpers shared by the code sandbox.
//!
//! Provides the sandboxed global environment and the host modules that
//! generated code may use. Everything here is synchronous; the sandbox runs
//! the VM on a blocking thread (via [`tokio::task::spawn_blocking`]).
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `np` | `sum`, `mean`, `median`, `std`, `min`, `max`, `percentile`, `corr`, `cumsum`, `histogram`, `linspace`, `round`, `abs`, `sqrt`, `log`, `floor`, `ceil`, `isnan` |
//! | `json` | `encode`, `decode` |
//! | `log` | `info`, `warn`, `debug` |
//! | `frame` | Lua prelude, see [`FRAME_PRELUDE`] |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `package`, `require`, `load`, `loadfile` and
//! `dofile` are removed from the globals.

use mlua::prelude::*;

/// Frame helpers written in Lua: `frame.select`, `frame.dropna`,
/// `frame.filter`, `frame.with_column`, `frame.group_by`, `frame.sort`,
/// `frame.head`, `frame.column`, `frame.unique`, `frame.value_counts`.
pub(crate) const FRAME_PRELUDE: &str = include_str!("frame_prelude.lua");

/// Install the sandboxed globals and every host module.
pub(crate) fn register_host_apis(lua: &Lua) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_numeric_api(lua)?;
    register_json_api(lua)?;
    register_log_api(lua)?;
    lua.load(FRAME_PRELUDE).set_name("frame").exec()?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing
// ═══════════════════════════════════════════════════════════════════════

/// Remove library entry points that reach outside the VM.
pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in [
        "os", "io", "debug", "package", "require", "load", "loadfile", "dofile",
    ] {
        globals.set(name, LuaValue::Nil)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: np
// ═══════════════════════════════════════════════════════════════════════

/// Read a Lua array of numbers.
pub(crate) fn numbers(value: LuaValue, what: &str) -> LuaResult<Vec<f64>> {
    let table = match value {
        LuaValue::Table(t) => t,
        other => {
            return Err(LuaError::RuntimeError(format!(
                "{}: expected an array of numbers, got {}",
                what,
                other.type_name()
            )))
        }
    };
    let len = table.raw_len();
    let mut out = Vec::with_capacity(len);
    for i in 1..=len {
        let v: LuaValue = table.raw_get(i)?;
        match v {
            LuaValue::Integer(n) => out.push(n as f64),
            LuaValue::Number(n) => out.push(n),
            other => {
                return Err(LuaError::RuntimeError(format!(
                    "{}: element {} is {}, expected a number (drop missing values first)",
                    what,
                    i,
                    other.type_name()
                )))
            }
        }
    }
    Ok(out)
}

fn non_empty(values: Vec<f64>, what: &str) -> LuaResult<Vec<f64>> {
    if values.is_empty() {
        return Err(LuaError::RuntimeError(format!("{}: empty array", what)));
    }
    Ok(values)
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Linear-interpolated percentile, `p` in [0, 100].
pub(crate) fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Population standard deviation.
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Pearson correlation; `NaN` when either side is constant.
pub(crate) fn correlation(x: &[f64], y: &[f64]) -> f64 {
    let (mx, my) = (mean(x), mean(y));
    let cov: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let vx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
    let vy: f64 = y.iter().map(|b| (b - my).powi(2)).sum();
    cov / (vx * vy).sqrt()
}

fn register_reducer(
    lua: &Lua,
    np: &LuaTable,
    name: &'static str,
    f: fn(&[f64]) -> f64,
) -> LuaResult<()> {
    np.set(
        name,
        lua.create_function(move |_lua, arr: LuaValue| {
            let what = format!("np.{}", name);
            let values = non_empty(numbers(arr, &what)?, &what)?;
            Ok(f(&values))
        })?,
    )
}

fn register_scalar(
    lua: &Lua,
    np: &LuaTable,
    name: &'static str,
    f: fn(f64) -> f64,
) -> LuaResult<()> {
    np.set(name, lua.create_function(move |_lua, x: f64| Ok(f(x)))?)
}

fn register_numeric_api(lua: &Lua) -> LuaResult<()> {
    let np = lua.create_table()?;

    register_reducer(lua, &np, "sum", |v| v.iter().sum())?;
    register_reducer(lua, &np, "mean", mean)?;
    register_reducer(lua, &np, "median", |v| percentile(v, 50.0))?;
    register_reducer(lua, &np, "std", std_dev)?;
    register_reducer(lua, &np, "min", |v| v.iter().cloned().fold(f64::INFINITY, f64::min))?;
    register_reducer(lua, &np, "max", |v| {
        v.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    })?;

    register_scalar(lua, &np, "abs", f64::abs)?;
    register_scalar(lua, &np, "sqrt", f64::sqrt)?;
    register_scalar(lua, &np, "log", f64::ln)?;
    register_scalar(lua, &np, "floor", f64::floor)?;
    register_scalar(lua, &np, "ceil", f64::ceil)?;

    np.set(
        "isnan",
        lua.create_function(|_lua, x: LuaValue| {
            Ok(match x {
                LuaValue::Number(n) => n.is_nan(),
                LuaValue::Integer(_) => false,
                _ => true,
            })
        })?,
    )?;

    np.set(
        "round",
        lua.create_function(|_lua, (x, digits): (f64, Option<i32>)| {
            let factor = 10f64.powi(digits.unwrap_or(0));
            Ok((x * factor).round() / factor)
        })?,
    )?;

    np.set(
        "percentile",
        lua.create_function(|_lua, (arr, p): (LuaValue, f64)| {
            let values = non_empty(numbers(arr, "np.percentile")?, "np.percentile")?;
            Ok(percentile(&values, p))
        })?,
    )?;

    np.set(
        "corr",
        lua.create_function(|_lua, (x, y): (LuaValue, LuaValue)| {
            let x = non_empty(numbers(x, "np.corr")?, "np.corr")?;
            let y = numbers(y, "np.corr")?;
            if x.len() != y.len() {
                return Err(LuaError::RuntimeError(format!(
                    "np.corr: length mismatch ({} vs {})",
                    x.len(),
                    y.len()
                )));
            }
            Ok(correlation(&x, &y))
        })?,
    )?;

    np.set(
        "cumsum",
        lua.create_function(|lua, arr: LuaValue| {
            let values = numbers(arr, "np.cumsum")?;
            let mut total = 0.0;
            let out: Vec<f64> = values
                .iter()
                .map(|v| {
                    total += v;
                    total
                })
                .collect();
            lua.create_sequence_from(out)
        })?,
    )?;

    np.set(
        "linspace",
        lua.create_function(|lua, (start, stop, n): (f64, f64, usize)| {
            let out: Vec<f64> = match n {
                0 => Vec::new(),
                1 => vec![start],
                _ => (0..n)
                    .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
                    .collect(),
            };
            lua.create_sequence_from(out)
        })?,
    )?;

    np.set(
        "histogram",
        lua.create_function(|lua, (arr, bins): (LuaValue, Option<usize>)| {
            let values = non_empty(numbers(arr, "np.histogram")?, "np.histogram")?;
            let bins = bins.unwrap_or(10).max(1);
            let lo = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };
            let mut counts = vec![0i64; bins];
            for v in &values {
                let idx = (((v - lo) / width) as usize).min(bins - 1);
                counts[idx] += 1;
            }
            let edges: Vec<f64> = (0..=bins).map(|i| lo + width * i as f64).collect();
            let out = lua.create_table()?;
            out.set("counts", lua.create_sequence_from(counts)?)?;
            out.set("edges", lua.create_sequence_from(edges)?)?;
            Ok(out)
        })?,
    )?;

    lua.globals().set("np", np)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "decode",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| LuaError::external(anyhow::anyhow!("json.decode: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| LuaError::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua) -> LuaResult<()> {
    let log = lua.create_table()?;

    log.set(
        "info",
        lua.create_function(|_lua, msg: String| {
            tracing::info!(target: "vizchat::generated", "{}", msg);
            Ok(())
        })?,
    )?;

    log.set(
        "warn",
        lua.create_function(|_lua, msg: String| {
            tracing::warn!(target: "vizchat::generated", "{}", msg);
            Ok(())
        })?,
    )?;

    log.set(
        "debug",
        lua.create_function(|_lua, msg: String| {
            tracing::debug!(target: "vizchat::generated", "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value conversion
// ═══════════════════════════════════════════════════════════════════════

/// Convert a JSON value to a Lua value.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table_with_capacity(arr.len(), 0)?;
            for (i, v) in arr.iter().enumerate() {
                table.raw_set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                table.raw_set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value.
///
/// Tables with a non-zero border are arrays, the rest are objects.
/// Functions and userdata become `null`; non-finite numbers too.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<LuaValue, LuaValue>() {
                    let (k, v) = pair?;
                    let key = match k {
                        LuaValue::String(s) => s.to_str()?.to_string(),
                        LuaValue::Integer(i) => i.to_string(),
                        LuaValue::Number(n) => n.to_string(),
                        other => {
                            return Err(LuaError::RuntimeError(format!(
                                "cannot use a {} as a table key in results",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}
