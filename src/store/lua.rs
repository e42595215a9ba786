//! Lua implementation of [`ScriptRuntime`].
//!
//! Every execution builds a fresh sandboxed state, loads the namespace into
//! its globals, runs the chunk, and reads the non-library globals back out.
//! Only data survives between executions; functions defined by a script are
//! dropped when the state is torn down.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use mlua::{
    Function, HookTriggers, Lua, MetaMethod, MultiValue, Table, UserData, UserDataMethods,
    Value as LuaValue, VmState,
};
use serde_json::Value as Json;

use super::figure::{ChartKind, Figure};
use super::runtime::{ExecOutput, ScriptError, ScriptRuntime};
use super::value::{Frame, Namespace, Value};
use crate::backend::SqliteBackend;

pub const INSTRUCTION_LIMIT: i64 = 500_000_000;
const INSTRUCTION_HOOK_INTERVAL: u32 = 10_000;
const DEFAULT_WALL_CLOCK: Duration = Duration::from_secs(120);
const MAX_DEPTH: usize = 16;

pub struct LuaRuntime {
    backend: Option<Arc<SqliteBackend>>,
    wall_clock: Duration,
}

struct Sandbox {
    lua: Lua,
    output: Rc<RefCell<Vec<String>>>,
    baseline: HashSet<String>,
}

impl LuaRuntime {
    pub fn new(backend: Option<Arc<SqliteBackend>>) -> Self {
        Self {
            backend,
            wall_clock: DEFAULT_WALL_CLOCK,
        }
    }

    pub fn with_wall_clock(mut self, limit: Duration) -> Self {
        self.wall_clock = limit;
        self
    }

    fn sandbox(&self) -> mlua::Result<Sandbox> {
        let lua = Lua::new();
        let output = Rc::new(RefCell::new(Vec::new()));
        let globals = lua.globals();

        {
            let output = output.clone();
            let print_fn = lua.create_function(move |_, args: MultiValue| {
                let line = args
                    .into_iter()
                    .map(|v| display_lua(&v))
                    .collect::<Vec<_>>()
                    .join("\t");
                output.borrow_mut().push(line);
                Ok(())
            })?;
            globals.set("print", print_fn)?;
        }

        for name in ["os", "io", "debug", "package", "require", "loadfile", "dofile", "load"] {
            globals.set(name, LuaValue::Nil)?;
        }

        globals.set("frame", frame_library(&lua)?)?;
        globals.set("chart", chart_library(&lua)?)?;

        let mut baseline = HashSet::new();
        for pair in globals.pairs::<LuaValue, LuaValue>() {
            let (key, _) = pair?;
            if let LuaValue::String(s) = key {
                baseline.insert(s.to_string_lossy().to_string());
            }
        }

        let started = Instant::now();
        let wall_clock = self.wall_clock;
        let budget = Arc::new(AtomicI64::new(INSTRUCTION_LIMIT));
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(INSTRUCTION_HOOK_INTERVAL),
            move |_lua, _debug| {
                if started.elapsed() > wall_clock {
                    return Err(mlua::Error::RuntimeError(format!(
                        "execution timeout ({}s limit)",
                        wall_clock.as_secs()
                    )));
                }
                let remaining = budget.fetch_sub(INSTRUCTION_HOOK_INTERVAL as i64, Ordering::Relaxed);
                if remaining <= 0 {
                    Err(mlua::Error::RuntimeError(format!(
                        "instruction limit exceeded ({INSTRUCTION_LIMIT} instructions)"
                    )))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        Ok(Sandbox {
            lua,
            output,
            baseline,
        })
    }

    fn load_namespace(&self, lua: &Lua, namespace: &Namespace) -> mlua::Result<()> {
        let globals = lua.globals();
        for (name, value) in namespace {
            globals.set(name.as_str(), self.to_lua(lua, value, 0)?)?;
        }
        Ok(())
    }

    fn collect_namespace(&self, sandbox: &Sandbox) -> mlua::Result<Namespace> {
        let mut namespace = Namespace::new();
        for pair in sandbox.lua.globals().pairs::<LuaValue, LuaValue>() {
            let (key, value) = pair?;
            let LuaValue::String(key) = key else { continue };
            let name = key.to_string_lossy().to_string();
            if sandbox.baseline.contains(&name) {
                continue;
            }
            match from_lua(&value, 0) {
                Some(v) => {
                    namespace.insert(name, v);
                }
                None => tracing::debug!(name = %name, kind = value.type_name(), "dropping non-data global"),
            }
        }
        Ok(namespace)
    }

    fn to_lua(&self, lua: &Lua, value: &Value, depth: usize) -> mlua::Result<LuaValue> {
        Ok(match value {
            Value::Nil => LuaValue::Nil,
            Value::Bool(b) => LuaValue::Boolean(*b),
            Value::Integer(i) => LuaValue::Integer(*i),
            Value::Number(n) => LuaValue::Number(*n),
            Value::Text(s) => LuaValue::String(lua.create_string(s)?),
            Value::Table(frame) => LuaValue::UserData(lua.create_userdata(FrameUd(frame.clone()))?),
            Value::Figure(figure) => LuaValue::UserData(lua.create_userdata(FigureUd(figure.clone()))?),
            Value::Sequence(items) if depth < MAX_DEPTH => {
                let table = lua.create_table()?;
                for (i, item) in items.iter().enumerate() {
                    table.raw_set(i + 1, self.to_lua(lua, item, depth + 1)?)?;
                }
                LuaValue::Table(table)
            }
            Value::Mapping(entries) if depth < MAX_DEPTH => {
                let table = lua.create_table()?;
                for (key, item) in entries {
                    table.raw_set(key.as_str(), self.to_lua(lua, item, depth + 1)?)?;
                }
                LuaValue::Table(table)
            }
            Value::Sequence(_) | Value::Mapping(_) => LuaValue::Nil,
            Value::Backend => match &self.backend {
                Some(backend) => LuaValue::UserData(lua.create_userdata(EngineUd(backend.clone()))?),
                None => LuaValue::Nil,
            },
        })
    }

    fn prepare(&self, namespace: &Namespace) -> Result<Sandbox, ScriptError> {
        let sandbox = self.sandbox().map_err(failure_from)?;
        self.load_namespace(&sandbox.lua, namespace).map_err(failure_from)?;
        Ok(sandbox)
    }
}

impl ScriptRuntime for LuaRuntime {
    fn seed(&self) -> Namespace {
        let mut namespace = Namespace::new();
        if self.backend.is_some() {
            namespace.insert("engine".to_string(), Value::Backend);
        }
        namespace
    }

    fn execute(&self, namespace: Namespace, script: &str) -> ExecOutput {
        let sandbox = match self.prepare(&namespace) {
            Ok(sandbox) => sandbox,
            Err(failure) => return ExecOutput::failed(namespace, failure),
        };

        let result = sandbox.lua.load(script).set_name("=script").exec();

        let collected = match self.collect_namespace(&sandbox) {
            Ok(collected) => collected,
            Err(e) => {
                tracing::warn!(error = %e, "could not read back namespace, keeping previous");
                namespace
            }
        };
        let output = sandbox.output.borrow().clone();
        ExecOutput {
            namespace: collected,
            output,
            failure: result.err().map(failure_from),
        }
    }

    fn evaluate(&self, namespace: &Namespace, expression: &str) -> Result<Value, ScriptError> {
        let expression = expression.trim();
        let sandbox = self.prepare(namespace)?;
        let is_name = !expression.is_empty()
            && expression.chars().all(|c| c.is_alphanumeric() || c == '_')
            && !expression.starts_with(|c: char| c.is_ascii_digit());
        if is_name && !namespace.contains_key(expression) && !sandbox.baseline.contains(expression) {
            return Err(ScriptError::new(
                format!("name '{expression}' is not defined"),
                String::new(),
            ));
        }

        let value = sandbox
            .lua
            .load(format!("return {expression}"))
            .set_name("=expression")
            .eval::<LuaValue>()
            .map_err(failure_from)?;
        Ok(from_lua(&value, 0).unwrap_or_else(|| Value::Text(display_lua(&value))))
    }

    fn format_expression(&self, expression: &str) -> String {
        match expression.split_once(":.") {
            Some((name, spec)) => format!("string.format(\"%.{}\", {})", spec.trim(), name.trim()),
            None => expression.to_string(),
        }
    }
}

fn failure_from(err: mlua::Error) -> ScriptError {
    let trace = err.to_string();
    let message = match &err {
        mlua::Error::CallbackError { cause, .. } => cause.to_string(),
        other => other.to_string(),
    };
    let message = message.lines().next().unwrap_or_default().to_string();
    ScriptError::new(message, trace)
}

fn runtime_error(message: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(message.into())
}

/// Convert a Lua value into namespace data. `None` for functions, threads,
/// and other values that cannot outlive the state.
fn from_lua(value: &LuaValue, depth: usize) -> Option<Value> {
    match value {
        LuaValue::Nil => Some(Value::Nil),
        LuaValue::Boolean(b) => Some(Value::Bool(*b)),
        LuaValue::Integer(i) => Some(Value::Integer(*i)),
        LuaValue::Number(n) => Some(Value::Number(*n)),
        LuaValue::String(s) => Some(Value::Text(s.to_string_lossy().to_string())),
        LuaValue::Table(table) => {
            if depth >= MAX_DEPTH {
                return Some(Value::Text("<nested table>".to_string()));
            }
            Some(table_from_lua(table, depth))
        }
        LuaValue::UserData(ud) => {
            if let Ok(frame) = ud.borrow::<FrameUd>() {
                Some(Value::Table(frame.0.clone()))
            } else if let Ok(figure) = ud.borrow::<FigureUd>() {
                Some(Value::Figure(figure.0.clone()))
            } else if ud.borrow::<EngineUd>().is_ok() {
                Some(Value::Backend)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn table_from_lua(table: &Table, depth: usize) -> Value {
    let len = table.raw_len();
    let mut entries: Vec<(LuaValue, LuaValue)> = Vec::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        match pair {
            Ok(pair) => entries.push(pair),
            Err(_) => continue,
        }
    }

    if entries.len() == len {
        let mut items = vec![Value::Nil; len];
        for (key, value) in &entries {
            if let LuaValue::Integer(i) = key {
                if *i >= 1 && (*i as usize) <= len {
                    items[*i as usize - 1] = from_lua(value, depth + 1).unwrap_or(Value::Nil);
                }
            }
        }
        return Value::Sequence(items);
    }

    let mut mapping = BTreeMap::new();
    for (key, value) in &entries {
        let key = match key {
            LuaValue::String(s) => s.to_string_lossy().to_string(),
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => n.to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            _ => continue,
        };
        if let Some(v) = from_lua(value, depth + 1) {
            mapping.insert(key, v);
        }
    }
    Value::Mapping(mapping)
}

fn display_lua(value: &LuaValue) -> String {
    match value {
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        LuaValue::Function(_) => "function".to_string(),
        LuaValue::Thread(_) => "thread".to_string(),
        other => match from_lua(other, 0) {
            Some(v) => v.to_string(),
            None => other.type_name().to_string(),
        },
    }
}

fn json_to_lua(lua: &Lua, cell: &Json) -> mlua::Result<LuaValue> {
    Ok(match cell {
        Json::Null => LuaValue::Nil,
        Json::Bool(b) => LuaValue::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => LuaValue::String(lua.create_string(s)?),
        other => LuaValue::String(lua.create_string(other.to_string())?),
    })
}

fn lua_to_json(value: &LuaValue) -> Json {
    match value {
        LuaValue::Boolean(b) => Json::Bool(*b),
        LuaValue::Integer(i) => Json::from(*i),
        LuaValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        LuaValue::String(s) => Json::String(s.to_string_lossy().to_string()),
        _ => Json::Null,
    }
}

fn row_table(lua: &Lua, frame: &Frame, position: usize) -> mlua::Result<Table> {
    let row = lua.create_table()?;
    if let Some(cells) = frame.row(position) {
        for (name, cell) in frame.columns.iter().zip(cells) {
            row.raw_set(name.as_str(), json_to_lua(lua, cell)?)?;
        }
    }
    Ok(row)
}

fn frame_library(lua: &Lua) -> mlua::Result<Table> {
    let library = lua.create_table()?;
    library.set(
        "new",
        lua.create_function(|_, (columns, rows): (Vec<String>, Option<Table>)| {
            let mut out = Vec::new();
            if let Some(rows) = rows {
                for row in rows.sequence_values::<Table>() {
                    let row = row?;
                    let mut cells: Vec<Json> = row
                        .sequence_values::<LuaValue>()
                        .map(|cell| cell.map(|c| lua_to_json(&c)))
                        .collect::<mlua::Result<_>>()?;
                    cells.resize(columns.len(), Json::Null);
                    out.push(cells);
                }
            }
            Ok(FrameUd(Arc::new(Frame::new(columns, out))))
        })?,
    )?;
    Ok(library)
}

fn chart_library(lua: &Lua) -> mlua::Result<Table> {
    let library = lua.create_table()?;
    for (name, kind) in [("bar", ChartKind::Bar), ("line", ChartKind::Line)] {
        library.set(
            name,
            lua.create_function(move |_, (title, labels, values): (String, Vec<String>, Vec<f64>)| {
                build_figure(kind, title, labels, values)
            })?,
        )?;
    }
    Ok(library)
}

fn build_figure(kind: ChartKind, title: String, labels: Vec<String>, values: Vec<f64>) -> mlua::Result<FigureUd> {
    let figure = Figure::new(kind, title, labels, values);
    figure.validate().map_err(|e| runtime_error(e.to_string()))?;
    Ok(FigureUd(Arc::new(figure)))
}

fn frame_chart(kind: ChartKind, frame: &Frame, label_col: &str, value_col: &str, title: Option<String>) -> mlua::Result<FigureUd> {
    let labels = frame
        .column(label_col)
        .ok_or_else(|| runtime_error(format!("no column named '{label_col}'")))?;
    let values = frame
        .column(value_col)
        .ok_or_else(|| runtime_error(format!("no column named '{value_col}'")))?;
    let labels = labels
        .iter()
        .map(|cell| match cell {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    let values = values.iter().map(|cell| cell.as_f64().unwrap_or(f64::NAN)).collect();
    build_figure(kind, title.unwrap_or_else(|| value_col.to_string()), labels, values)
}

struct FrameUd(Arc<Frame>);

impl FrameUd {
    fn wrap(result: Result<Frame, String>) -> mlua::Result<FrameUd> {
        result.map(|f| FrameUd(Arc::new(f))).map_err(runtime_error)
    }
}

impl UserData for FrameUd {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("nrows", |_, this, ()| Ok(this.0.nrows()));

        methods.add_method("columns", |_, this, ()| Ok(this.0.columns.clone()));

        methods.add_method("head", |_, this, n: Option<usize>| {
            Ok(FrameUd(Arc::new(this.0.head(n.unwrap_or(5)))))
        });

        methods.add_method("column", |lua, this, name: String| {
            let cells = this
                .0
                .column(&name)
                .ok_or_else(|| runtime_error(format!("no column named '{name}'")))?;
            let table = lua.create_table()?;
            for (i, cell) in cells.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, cell)?)?;
            }
            Ok(table)
        });

        // 1-based, like every other Lua sequence.
        methods.add_method("row", |lua, this, position: usize| {
            if position == 0 || position > this.0.nrows() {
                return Err(runtime_error(format!(
                    "row {position} out of range (1..{})",
                    this.0.nrows()
                )));
            }
            row_table(lua, &this.0, position - 1)
        });

        methods.add_method("sort_by", |_, this, (name, descending): (String, Option<bool>)| {
            FrameUd::wrap(this.0.sort_by(&name, descending.unwrap_or(false)))
        });

        methods.add_method("filter", |lua, this, predicate: Function| {
            let mut keep = Vec::with_capacity(this.0.nrows());
            for position in 0..this.0.nrows() {
                keep.push(predicate.call::<bool>(row_table(lua, &this.0, position)?)?);
            }
            Ok(FrameUd(Arc::new(this.0.filter_rows(&keep))))
        });

        methods.add_method("set_index", |_, this, name: String| FrameUd::wrap(this.0.set_index(&name)));

        methods.add_method("reset_index", |_, this, ()| Ok(FrameUd(Arc::new(this.0.reset_index()))));

        methods.add_method("sum", |_, this, name: String| this.0.sum(&name).map_err(runtime_error));

        methods.add_method("mean", |_, this, name: String| this.0.mean(&name).map_err(runtime_error));

        methods.add_method(
            "bar_chart",
            |_, this, (label_col, value_col, title): (String, String, Option<String>)| {
                frame_chart(ChartKind::Bar, &this.0, &label_col, &value_col, title)
            },
        );

        methods.add_method(
            "line_chart",
            |_, this, (label_col, value_col, title): (String, String, Option<String>)| {
                frame_chart(ChartKind::Line, &this.0, &label_col, &value_col, title)
            },
        );

        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.nrows()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
    }
}

struct FigureUd(Arc<Figure>);

impl UserData for FigureUd {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("title", |_, this, ()| Ok(this.0.title.clone()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("<figure: {}>", this.0.title))
        });
    }
}

struct EngineUd(Arc<SqliteBackend>);

impl UserData for EngineUd {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("query", |_, this, sql: String| {
            let frame = this.0.query(&sql).map_err(|e| runtime_error(e.to_string()))?;
            Ok(FrameUd(Arc::new(frame)))
        });

        methods.add_method("tables", |_, this, ()| {
            this.0.table_names().map_err(|e| runtime_error(e.to_string()))
        });

        methods.add_meta_method(MetaMethod::ToString, |_, _, ()| Ok("<engine>".to_string()));
    }
}
