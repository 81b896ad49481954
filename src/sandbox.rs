//! Execution of generated Lua code.
//!
//! Each [`CodeSandbox::execute`] call builds a fresh Lua VM on a blocking
//! thread, installs the host modules from [`crate::lua_runtime`] plus the
//! caller's [`Bindings`], runs the code and reads back one global.
//!
//! Limits:
//! - wall clock: instruction-count hook checking a deadline
//! - memory: the VM allocator limit
//! - filesystem: no `io`/`os`; the only write path is `plt.savefig` to the
//!   bound `save_file_name`
//!
//! Nothing survives between calls except what the bindings point at.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::prelude::*;
use tracing::debug;
use vizchat_core::frame::TabularFrame;

use crate::config::SandboxConfig;
use crate::error::PipelineError;
use crate::lua_runtime::{json_value_to_lua, lua_value_to_json, numbers, register_host_apis};
use crate::plot::{PlotSurface, Series, SeriesKind, XValues};

/// Resource limits of one execution.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_limit: usize,
}

impl SandboxLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.timeout(),
            memory_limit: config.memory_limit_mb * 1024 * 1024,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

/// A value made visible to generated code under a global name.
#[derive(Debug, Clone)]
pub enum Binding {
    Frame(Arc<TabularFrame>),
    Text(String),
    Surface(PlotSurface),
}

/// Named values for one execution.
///
/// The numeric library (`np`) and frame helpers (`frame`) are always
/// present. A `plt` surface is always bound; when the caller does not
/// provide one, a detached surface that cannot save is used.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: Vec<(String, Binding)>,
    interactive: bool,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(mut self, name: &str, frame: Arc<TabularFrame>) -> Self {
        self.entries.push((name.to_string(), Binding::Frame(frame)));
        self
    }

    pub fn text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.entries.push((name.to_string(), Binding::Text(value.into())));
        self
    }

    pub fn surface(mut self, name: &str, surface: PlotSurface) -> Self {
        self.entries.push((name.to_string(), Binding::Surface(surface)));
        self
    }

    /// Also bind the `interact` helpers (hover labels) for the last
    /// surface bound.
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }
}

/// Strip markdown fence artifacts from generated code: leading and
/// trailing backtick runs and a language tag on the first line.
pub fn clean_code(code: &str) -> String {
    let trimmed = code.trim().trim_matches('`').trim_start();
    let without_tag = ["lua", "python", "Lua", "Python"]
        .iter()
        .find_map(|tag| {
            trimmed
                .strip_prefix(tag)
                .filter(|rest| rest.starts_with('\n') || rest.starts_with("\r\n"))
        })
        .unwrap_or(trimmed);
    without_tag.trim().to_string()
}

/// Runs generated code with bounded time and memory.
#[derive(Debug, Clone, Default)]
pub struct CodeSandbox {
    limits: SandboxLimits,
}

impl CodeSandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Execute `code` and return the JSON form of the global `result_name`.
    ///
    /// Returns `Ok(None)` when the code runs but never binds `result_name`.
    /// Any error raised by the code (including timeouts and memory
    /// exhaustion) is a [`PipelineError::CodeExecution`].
    pub async fn execute(
        &self,
        code: &str,
        bindings: Bindings,
        result_name: &str,
    ) -> Result<Option<serde_json::Value>, PipelineError> {
        let code = clean_code(code);
        let result_name = result_name.to_string();
        let limits = self.limits;
        tokio::task::spawn_blocking(move || run_code(&code, &bindings, &result_name, limits))
            .await
            .map_err(|e| PipelineError::CodeExecution(format!("sandbox task failed: {}", e)))?
    }
}

fn exec_err(e: LuaError) -> PipelineError {
    PipelineError::CodeExecution(e.to_string())
}

/// Run code synchronously on the current (blocking) thread.
fn run_code(
    code: &str,
    bindings: &Bindings,
    result_name: &str,
    limits: SandboxLimits,
) -> Result<Option<serde_json::Value>, PipelineError> {
    let lua = Lua::new();
    lua.set_memory_limit(limits.memory_limit).map_err(exec_err)?;

    let timeout = limits.timeout;
    let deadline = Instant::now() + timeout;
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(LuaError::RuntimeError(format!(
                    "generated code timed out after {} seconds",
                    timeout.as_secs_f64()
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    register_host_apis(&lua).map_err(exec_err)?;
    install_bindings(&lua, bindings).map_err(exec_err)?;

    debug!(result = result_name, "executing generated code");
    lua.load(code)
        .set_name("generated")
        .exec()
        .map_err(exec_err)?;

    let value: LuaValue = lua.globals().get(result_name).map_err(exec_err)?;
    if value.is_nil() {
        return Ok(None);
    }
    lua_value_to_json(value).map(Some).map_err(exec_err)
}

fn install_bindings(lua: &Lua, bindings: &Bindings) -> LuaResult<()> {
    let globals = lua.globals();
    let mut last_surface = None;

    for (name, binding) in &bindings.entries {
        match binding {
            Binding::Frame(frame) => {
                let value = serde_json::to_value(frame.as_ref()).map_err(LuaError::external)?;
                globals.set(name.as_str(), json_value_to_lua(lua, &value)?)?;
            }
            Binding::Text(text) => globals.set(name.as_str(), text.as_str())?,
            Binding::Surface(surface) => {
                globals.set(name.as_str(), plot_api(lua, surface)?)?;
                last_surface = Some(surface.clone());
            }
        }
    }

    if !bindings.has("plt") {
        globals.set("plt", plot_api(lua, &PlotSurface::detached())?)?;
    }
    if bindings.interactive {
        let surface = last_surface.unwrap_or_else(PlotSurface::detached);
        globals.set("interact", interact_api(lua, &surface)?)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// plt / interact
// ═══════════════════════════════════════════════════════════════════════

fn labels(value: LuaValue, what: &str) -> LuaResult<Vec<String>> {
    let LuaValue::Table(table) = value else {
        return Err(LuaError::RuntimeError(format!(
            "{}: expected an array of labels, got {}",
            what,
            value.type_name()
        )));
    };
    let len = table.raw_len();
    let mut out = Vec::with_capacity(len);
    for i in 1..=len {
        let v: LuaValue = table.raw_get(i)?;
        out.push(match v {
            LuaValue::String(s) => s.to_str()?.to_string(),
            LuaValue::Integer(n) => n.to_string(),
            LuaValue::Number(n) => n.to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            other => {
                return Err(LuaError::RuntimeError(format!(
                    "{}: element {} is {}, expected a label",
                    what,
                    i,
                    other.type_name()
                )))
            }
        });
    }
    Ok(out)
}

/// Numbers when every element is numeric, labels otherwise.
fn x_values(value: LuaValue, what: &str) -> LuaResult<XValues> {
    match numbers(value.clone(), what) {
        Ok(v) => Ok(XValues::Numeric(v)),
        Err(_) => labels(value, what).map(XValues::Categorical),
    }
}

fn parse_color(text: &str) -> Option<(u8, u8, u8)> {
    let hex = text.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some((channel(0)?, channel(2)?, channel(4)?))
}

fn named_color(text: &str) -> Option<(u8, u8, u8)> {
    match text {
        "blue" => Some((31, 119, 180)),
        "orange" => Some((255, 127, 14)),
        "green" => Some((44, 160, 44)),
        "red" => Some((214, 39, 40)),
        "purple" => Some((148, 103, 189)),
        "gray" | "grey" => Some((127, 127, 127)),
        "black" => Some((0, 0, 0)),
        _ => parse_color(text),
    }
}

/// Apply `{ label = ..., color = ... }` options to a series.
fn with_options(mut series: Series, opts: &Option<LuaTable>) -> LuaResult<Series> {
    if let Some(opts) = opts {
        series.label = opts.get::<Option<String>>("label")?;
        if let Some(color) = opts.get::<Option<String>>("color")? {
            series.color = Some(named_color(&color).ok_or_else(|| {
                LuaError::RuntimeError(format!("unknown color '{}'", color))
            })?);
        }
    }
    Ok(series)
}

fn add(surface: &PlotSurface, series: Series) -> LuaResult<()> {
    surface.add_series(series).map_err(LuaError::external)
}

fn plot_api(lua: &Lua, surface: &PlotSurface) -> LuaResult<LuaTable> {
    let plt = lua.create_table()?;

    let s = surface.clone();
    plt.set(
        "figure",
        lua.create_function(move |_lua, opts: Option<LuaTable>| {
            let Some(opts) = opts else { return Ok(()) };
            let title: Option<String> = opts.get("title")?;
            let xlabel: Option<String> = opts.get("xlabel")?;
            let ylabel: Option<String> = opts.get("ylabel")?;
            let width: Option<u32> = opts.get("width")?;
            let height: Option<u32> = opts.get("height")?;
            s.update(|f| {
                if let Some(t) = title {
                    f.title = t;
                }
                if let Some(x) = xlabel {
                    f.x_label = x;
                }
                if let Some(y) = ylabel {
                    f.y_label = y;
                }
                if let Some(w) = width {
                    f.width = w.clamp(200, 2400);
                }
                if let Some(h) = height {
                    f.height = h.clamp(150, 1800);
                }
            })
            .map_err(LuaError::external)
        })?,
    )?;

    for (name, field) in [("title", 0u8), ("xlabel", 1), ("ylabel", 2)] {
        let s = surface.clone();
        plt.set(
            name,
            lua.create_function(move |_lua, text: String| {
                s.update(|f| match field {
                    0 => f.title = text,
                    1 => f.x_label = text,
                    _ => f.y_label = text,
                })
                .map_err(LuaError::external)
            })?,
        )?;
    }

    let s = surface.clone();
    plt.set(
        "plot",
        lua.create_function(move |_lua, (x, y, opts): (LuaValue, LuaValue, Option<LuaTable>)| {
            let kind = SeriesKind::Line {
                x: x_values(x, "plt.plot")?,
                y: numbers(y, "plt.plot")?,
            };
            add(&s, with_options(Series::new(kind), &opts)?)
        })?,
    )?;

    let s = surface.clone();
    plt.set(
        "area",
        lua.create_function(move |_lua, (x, y, opts): (LuaValue, LuaValue, Option<LuaTable>)| {
            let kind = SeriesKind::Area {
                x: x_values(x, "plt.area")?,
                y: numbers(y, "plt.area")?,
            };
            add(&s, with_options(Series::new(kind), &opts)?)
        })?,
    )?;

    let s = surface.clone();
    plt.set(
        "bar",
        lua.create_function(
            move |_lua, (categories, values, opts): (LuaValue, LuaValue, Option<LuaTable>)| {
                let kind = SeriesKind::Bar {
                    categories: labels(categories, "plt.bar")?,
                    values: numbers(values, "plt.bar")?,
                };
                add(&s, with_options(Series::new(kind), &opts)?)
            },
        )?,
    )?;

    let s = surface.clone();
    plt.set(
        "scatter",
        lua.create_function(move |_lua, (x, y, opts): (LuaValue, LuaValue, Option<LuaTable>)| {
            let size = match &opts {
                Some(o) => o.get::<Option<f64>>("size")?.unwrap_or(4.0),
                None => 4.0,
            };
            let kind = SeriesKind::Scatter {
                x: numbers(x, "plt.scatter")?,
                y: numbers(y, "plt.scatter")?,
                size: size.clamp(1.0, 30.0),
            };
            add(&s, with_options(Series::new(kind), &opts)?)
        })?,
    )?;

    let s = surface.clone();
    plt.set(
        "pie",
        lua.create_function(
            move |_lua, (values, names, opts): (LuaValue, LuaValue, Option<LuaTable>)| {
                let kind = SeriesKind::Pie {
                    labels: labels(names, "plt.pie")?,
                    values: numbers(values, "plt.pie")?,
                };
                add(&s, with_options(Series::new(kind), &opts)?)
            },
        )?,
    )?;

    let s = surface.clone();
    plt.set(
        "hexbin",
        lua.create_function(move |_lua, (x, y, opts): (LuaValue, LuaValue, Option<LuaTable>)| {
            let gridsize = match &opts {
                Some(o) => o.get::<Option<usize>>("gridsize")?.unwrap_or(20),
                None => 20,
            };
            let kind = SeriesKind::Hexbin {
                x: numbers(x, "plt.hexbin")?,
                y: numbers(y, "plt.hexbin")?,
                gridsize: gridsize.clamp(2, 200),
            };
            add(&s, with_options(Series::new(kind), &opts)?)
        })?,
    )?;

    // Labelled series always get a legend; accepted so matplotlib-style code runs.
    plt.set("legend", lua.create_function(|_lua, _args: LuaMultiValue| Ok(()))?)?;

    let s = surface.clone();
    plt.set(
        "savefig",
        lua.create_function(move |_lua, path: String| {
            s.save(&PathBuf::from(path)).map_err(LuaError::external)
        })?,
    )?;

    Ok(plt)
}

fn interact_api(lua: &Lua, surface: &PlotSurface) -> LuaResult<LuaTable> {
    let interact = lua.create_table()?;
    let s = surface.clone();
    interact.set(
        "hover",
        lua.create_function(move |_lua, texts: LuaValue| {
            let texts = labels(texts, "interact.hover")?;
            s.hover(texts).map_err(LuaError::external)
        })?,
    )?;
    Ok(interact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cars() -> Arc<TabularFrame> {
        Arc::new(
            TabularFrame::from_json(&json!([
                {"engine_size": 1.6, "city_mpg": 31, "vehicle_type": "sedan"},
                {"engine_size": 3.0, "city_mpg": 19, "vehicle_type": "suv"},
                {"engine_size": 2.0, "city_mpg": null, "vehicle_type": "sedan"},
                {"engine_size": 5.0, "city_mpg": 14, "vehicle_type": "truck"}
            ]))
            .unwrap(),
        )
    }

    #[test]
    fn clean_code_strips_fences_and_tag() {
        assert_eq!(clean_code("```lua\nx = 1\n```"), "x = 1");
        assert_eq!(clean_code("```python\nx = 1\n```"), "x = 1");
        assert_eq!(clean_code("  x = 1  "), "x = 1");
        // an identifier starting with a tag name is left alone
        assert_eq!(clean_code("luaval = 1"), "luaval = 1");
    }

    #[tokio::test]
    async fn returns_bound_result() {
        let sandbox = CodeSandbox::default();
        let code = r#"
            local clean = frame.dropna(df, { "city_mpg" })
            extract_df = frame.select(clean, { "engine_size", "city_mpg" })
        "#;
        let value = sandbox
            .execute(code, Bindings::new().frame("df", cars()), "extract_df")
            .await
            .unwrap()
            .unwrap();
        let frame = TabularFrame::from_json(&value).unwrap();
        assert_eq!(frame.columns, vec!["engine_size", "city_mpg"]);
        assert_eq!(frame.len(), 3);
    }

    #[tokio::test]
    async fn missing_result_is_none() {
        let sandbox = CodeSandbox::default();
        let value = sandbox
            .execute("local x = 1 + 1", Bindings::new(), "extract_df")
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn errors_become_code_execution() {
        let sandbox = CodeSandbox::default();
        let err = sandbox
            .execute("error('boom')", Bindings::new(), "extract_df")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CodeExecution(ref m) if m.contains("boom")));

        let err = sandbox
            .execute("local f = io.open('/etc/passwd')", Bindings::new(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CodeExecution(_)));
    }

    #[tokio::test]
    async fn runaway_code_times_out() {
        let sandbox = CodeSandbox::new(SandboxLimits {
            timeout: Duration::from_millis(200),
            memory_limit: 64 * 1024 * 1024,
        });
        let err = sandbox
            .execute("while true do end", Bindings::new(), "x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn memory_is_capped() {
        let sandbox = CodeSandbox::new(SandboxLimits {
            timeout: Duration::from_secs(10),
            memory_limit: 4 * 1024 * 1024,
        });
        let code = "local t = {} for i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end";
        assert!(sandbox.execute(code, Bindings::new(), "x").await.is_err());
    }

    #[tokio::test]
    async fn calls_do_not_share_state() {
        let sandbox = CodeSandbox::default();
        sandbox
            .execute("leaked = 42", Bindings::new(), "leaked")
            .await
            .unwrap();
        let value = sandbox
            .execute("x = leaked", Bindings::new(), "x")
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn plotting_writes_only_the_bound_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("scatter.svg");
        let surface = PlotSurface::with_output(out.clone());
        let bindings = Bindings::new()
            .frame("df", cars())
            .surface("plt", surface.clone())
            .text("save_file_name", out.to_string_lossy())
            .interactive();
        let code = r##"
            local clean = frame.dropna(df)
            local x = frame.column(clean, "engine_size")
            local y = frame.column(clean, "city_mpg")
            plt.figure({ title = "Engine size vs mpg", xlabel = "engine_size", ylabel = "city_mpg" })
            plt.scatter(x, y, { label = "cars", color = "#336699" })
            interact.hover(frame.column(clean, "vehicle_type"))
            plt.savefig(save_file_name)
            extract_viz = save_file_name
        "##;
        let value = sandbox_exec(code, bindings).await;
        assert_eq!(value, Some(json!(out.to_string_lossy())));
        let svg = std::fs::read_to_string(&out).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("<title>suv</title>"));
        let figure = surface.figure().unwrap();
        assert_eq!(figure.series.len(), 1);
        assert_eq!(figure.series[0].color, Some((0x33, 0x66, 0x99)));

        let other = dir.path().join("other.svg");
        let err = CodeSandbox::default()
            .execute(
                &format!("plt.bar({{'a'}}, {{1}}) plt.savefig('{}')", other.display()),
                Bindings::new().surface("plt", PlotSurface::with_output(out.clone())),
                "x",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("save_file_name"));
        assert!(!other.exists());
    }

    async fn sandbox_exec(code: &str, bindings: Bindings) -> Option<serde_json::Value> {
        CodeSandbox::default()
            .execute(code, bindings, "extract_viz")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn group_by_and_sort_helpers() {
        let code = r#"
            local g = frame.group_by(df, "vehicle_type", { avg_engine = { "engine_size", "mean" }, n = { "engine_size", "count" } })
            extract_df = frame.sort(g, "avg_engine", true)
        "#;
        let value = CodeSandbox::default()
            .execute(code, Bindings::new().frame("df", cars()), "extract_df")
            .await
            .unwrap()
            .unwrap();
        let frame = TabularFrame::from_json(&value).unwrap();
        assert_eq!(frame.columns, vec!["vehicle_type", "avg_engine", "n"]);
        assert_eq!(frame.rows[0]["vehicle_type"], "truck");
        assert_eq!(frame.rows.last().unwrap()["avg_engine"], json!(1.8));
    }
}
