// engine/expr.rs
// Aggregation expressions: field references, variables and operators

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::document::{is_object_id, parse_date, ObjectId};
use crate::error::{Result, SampleDbError};
use crate::value_utils::{compare_values_total, canonical_json_string, number_to_value, type_name};

/// Parsed aggregation expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `"$a.b"`
    Field(String),
    /// `"$$this"`, `"$$ROOT.a"`
    Variable(String, Option<String>),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    /// Positional operator: `{"$size": "$tags"}`, `{"$eq": ["$a", 1]}`
    Op(String, Vec<Expr>),
    Filter {
        input: Box<Expr>,
        var: String,
        cond: Box<Expr>,
    },
    Map {
        input: Box<Expr>,
        var: String,
        body: Box<Expr>,
    },
    Let {
        vars: Vec<(String, Expr)>,
        body: Box<Expr>,
    },
    Cond {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

/// Variables visible while evaluating an expression
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    root: &'a Value,
    vars: Vec<(String, Value)>,
}

impl<'a> EvalContext<'a> {
    pub fn new(root: &'a Value) -> Self {
        EvalContext {
            root,
            vars: Vec::new(),
        }
    }

    pub fn with_var(&self, name: &str, value: Value) -> EvalContext<'a> {
        let mut vars = self.vars.clone();
        vars.push((name.to_string(), value));
        EvalContext {
            root: self.root,
            vars,
        }
    }

    fn var(&self, name: &str) -> Option<&Value> {
        if name == "ROOT" || name == "CURRENT" {
            return Some(self.root);
        }
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

fn agg_error(message: String) -> SampleDbError {
    SampleDbError::AggregationError(message)
}

impl Expr {
    /// Parse an expression from its JSON form
    pub fn parse(value: &Value) -> Result<Expr> {
        match value {
            Value::String(s) if s.starts_with("$$") => {
                let body = &s[2..];
                Ok(match body.split_once('.') {
                    Some((name, path)) => Expr::Variable(name.to_string(), Some(path.to_string())),
                    None => Expr::Variable(body.to_string(), None),
                })
            }
            Value::String(s) if s.starts_with('$') && s.len() > 1 => Ok(Expr::Field(s[1..].to_string())),
            Value::Array(items) => items.iter().map(Expr::parse).collect::<Result<Vec<_>>>().map(Expr::Array),
            Value::Object(map) if map.len() == 1 && !is_object_id(value) => {
                let (key, arg) = map.iter().next().ok_or_else(|| agg_error("empty expression".into()))?;
                if key.starts_with('$') && key != "$date" {
                    Self::parse_operator(key, arg)
                } else {
                    Ok(Expr::Object(vec![(key.clone(), Expr::parse(arg)?)]))
                }
            }
            Value::Object(map) if !is_object_id(value) && !crate::document::is_date(value) => {
                let mut fields = Vec::with_capacity(map.len());
                for (k, v) in map {
                    if k.starts_with('$') {
                        return Err(agg_error(format!("Unexpected operator '{}' in object expression", k)));
                    }
                    fields.push((k.clone(), Expr::parse(v)?));
                }
                Ok(Expr::Object(fields))
            }
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    fn parse_operator(name: &str, arg: &Value) -> Result<Expr> {
        match name {
            "$literal" => Ok(Expr::Literal(arg.clone())),
            "$filter" | "$map" => {
                let spec = arg
                    .as_object()
                    .ok_or_else(|| agg_error(format!("{} requires an object", name)))?;
                let input = spec
                    .get("input")
                    .ok_or_else(|| agg_error(format!("{} requires 'input'", name)))?;
                let var = spec.get("as").and_then(|v| v.as_str()).unwrap_or("this").to_string();
                let body_key = if name == "$filter" { "cond" } else { "in" };
                let body = spec
                    .get(body_key)
                    .ok_or_else(|| agg_error(format!("{} requires '{}'", name, body_key)))?;

                let input = Box::new(Expr::parse(input)?);
                let body = Box::new(Expr::parse(body)?);
                Ok(if name == "$filter" {
                    Expr::Filter { input, var, cond: body }
                } else {
                    Expr::Map { input, var, body }
                })
            }
            "$let" => {
                let spec = arg.as_object().ok_or_else(|| agg_error("$let requires an object".into()))?;
                let vars = spec
                    .get("vars")
                    .and_then(|v| v.as_object())
                    .ok_or_else(|| agg_error("$let requires 'vars'".into()))?
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Expr::parse(v)?)))
                    .collect::<Result<Vec<_>>>()?;
                let body = spec.get("in").ok_or_else(|| agg_error("$let requires 'in'".into()))?;
                Ok(Expr::Let {
                    vars,
                    body: Box::new(Expr::parse(body)?),
                })
            }
            "$cond" => {
                let (c, t, e) = match arg {
                    Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                    Value::Object(spec) => (
                        spec.get("if").ok_or_else(|| agg_error("$cond requires 'if'".into()))?,
                        spec.get("then").ok_or_else(|| agg_error("$cond requires 'then'".into()))?,
                        spec.get("else").ok_or_else(|| agg_error("$cond requires 'else'".into()))?,
                    ),
                    _ => return Err(agg_error("$cond requires [if, then, else]".into())),
                };
                Ok(Expr::Cond {
                    condition: Box::new(Expr::parse(c)?),
                    then: Box::new(Expr::parse(t)?),
                    otherwise: Box::new(Expr::parse(e)?),
                })
            }
            _ => {
                let args = match arg {
                    Value::Array(items) => items.iter().map(Expr::parse).collect::<Result<Vec<_>>>()?,
                    other => vec![Expr::parse(other)?],
                };
                Ok(Expr::Op(name.to_string(), args))
            }
        }
    }

    /// Evaluate; `None` means the value is missing
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<Option<Value>> {
        match self {
            Expr::Literal(v) => Ok(Some(v.clone())),
            Expr::Field(path) => Ok(field_path_value(ctx.root, path)),
            Expr::Variable(name, path) => {
                let base = ctx
                    .var(name)
                    .ok_or_else(|| agg_error(format!("Undefined variable '$${}'", name)))?;
                Ok(match path {
                    Some(p) => field_path_value(base, p),
                    None => Some(base.clone()),
                })
            }
            Expr::Object(fields) => {
                let mut out = Map::new();
                for (k, e) in fields {
                    if let Some(v) = e.eval(ctx)? {
                        out.insert(k.clone(), v);
                    }
                }
                Ok(Some(Value::Object(out)))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for e in items {
                    out.push(e.eval(ctx)?.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(out)))
            }
            Expr::Filter { input, var, cond } => {
                let items = match input.eval(ctx)? {
                    None | Some(Value::Null) => return Ok(Some(Value::Null)),
                    Some(Value::Array(items)) => items,
                    Some(other) => {
                        return Err(agg_error(format!("$filter input must be an array, found {}", type_name(&other))))
                    }
                };
                let mut out = Vec::new();
                for item in items {
                    let inner = ctx.with_var(var, item.clone());
                    if truthy(cond.eval(&inner)?.as_ref()) {
                        out.push(item);
                    }
                }
                Ok(Some(Value::Array(out)))
            }
            Expr::Map { input, var, body } => {
                let items = match input.eval(ctx)? {
                    None | Some(Value::Null) => return Ok(Some(Value::Null)),
                    Some(Value::Array(items)) => items,
                    Some(other) => {
                        return Err(agg_error(format!("$map input must be an array, found {}", type_name(&other))))
                    }
                };
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let inner = ctx.with_var(var, item);
                    out.push(body.eval(&inner)?.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(out)))
            }
            Expr::Let { vars, body } => {
                let mut inner = ctx.clone();
                for (name, e) in vars {
                    let value = e.eval(ctx)?.unwrap_or(Value::Null);
                    inner = inner.with_var(name, value);
                }
                body.eval(&inner)
            }
            Expr::Cond { condition, then, otherwise } => {
                if truthy(condition.eval(ctx)?.as_ref()) {
                    then.eval(ctx)
                } else {
                    otherwise.eval(ctx)
                }
            }
            Expr::Op(name, args) => eval_operator(name, args, ctx),
        }
    }

    /// Evaluate against a document with no extra variables
    pub fn eval_doc(&self, doc: &Value) -> Result<Option<Value>> {
        self.eval(&EvalContext::new(doc))
    }
}

/// Resolve an aggregation field path; arrays map over their documents
pub fn field_path_value(value: &Value, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    field_path_inner(value, &parts)
}

fn field_path_inner(value: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) if !is_object_id(value) => {
            map.get(*head).and_then(|child| field_path_inner(child, rest))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|item| item.is_object() || item.is_array())
                .filter_map(|item| field_path_inner(item, parts))
                .collect(),
        )),
        _ => None,
    }
}

/// Aggregation truthiness: null, missing, false and zero are false
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(_) => true,
    }
}

/// Equality used by `$eq`, `$in`, lookups and group keys
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || canonical_json_string(a) == canonical_json_string(b)
}

fn eval_args(args: &[Expr], ctx: &EvalContext<'_>) -> Result<Vec<Option<Value>>> {
    args.iter().map(|a| a.eval(ctx)).collect()
}

fn expect_args(name: &str, args: &[Option<Value>], count: usize) -> Result<()> {
    if args.len() != count {
        return Err(agg_error(format!(
            "{} expects {} argument(s), got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}

fn compare_args(name: &str, args: &[Option<Value>]) -> Result<Ordering> {
    expect_args(name, args, 2)?;
    let a = args[0].clone().unwrap_or(Value::Null);
    let b = args[1].clone().unwrap_or(Value::Null);
    if values_equal(&a, &b) {
        return Ok(Ordering::Equal);
    }
    Ok(compare_values_total(&a, &b))
}

fn numeric_args(name: &str, args: &[Option<Value>]) -> Result<Option<Vec<f64>>> {
    let mut out = Vec::with_capacity(args.len());
    for a in args {
        match a {
            None | Some(Value::Null) => return Ok(None),
            Some(v) => out.push(
                v.as_f64()
                    .ok_or_else(|| agg_error(format!("{} only supports numeric types, found {}", name, type_name(v))))?,
            ),
        }
    }
    Ok(Some(out))
}

/// Values of an accumulator-style array operator (`{"$sum": "$list"}`)
fn array_operand(args: Vec<Option<Value>>) -> Vec<Value> {
    if args.len() == 1 {
        match args.into_iter().next().flatten() {
            Some(Value::Array(items)) => items,
            Some(v) => vec![v],
            None => Vec::new(),
        }
    } else {
        args.into_iter().flatten().collect()
    }
}

fn eval_operator(name: &str, args: &[Expr], ctx: &EvalContext<'_>) -> Result<Option<Value>> {
    let values = eval_args(args, ctx)?;

    let result = match name {
        "$type" => {
            expect_args(name, &values, 1)?;
            Value::String(match &values[0] {
                None => "missing".to_string(),
                Some(v) => type_name(v).to_string(),
            })
        }
        "$size" => {
            expect_args(name, &values, 1)?;
            match &values[0] {
                Some(Value::Array(items)) => Value::from(items.len()),
                other => {
                    return Err(agg_error(format!(
                        "The argument to $size must be an array, found {}",
                        other.as_ref().map(type_name).unwrap_or("missing")
                    )))
                }
            }
        }
        "$arrayElemAt" => {
            expect_args(name, &values, 2)?;
            let index = match &values[1] {
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| agg_error("$arrayElemAt index must be an integer".to_string()))?,
                None => return Ok(None),
            };
            match &values[0] {
                Some(Value::Array(items)) => {
                    let i = if index < 0 { items.len() as i64 + index } else { index };
                    match usize::try_from(i).ok().and_then(|i| items.get(i)) {
                        Some(item) => item.clone(),
                        None => return Ok(None),
                    }
                }
                None | Some(Value::Null) => Value::Null,
                Some(other) => {
                    return Err(agg_error(format!(
                        "$arrayElemAt requires an array, found {}",
                        type_name(other)
                    )))
                }
            }
        }
        "$isArray" => {
            expect_args(name, &values, 1)?;
            Value::Bool(matches!(values[0], Some(Value::Array(_))))
        }
        "$objectToArray" => {
            expect_args(name, &values, 1)?;
            match &values[0] {
                None | Some(Value::Null) => Value::Null,
                Some(Value::Object(map)) if !(map.len() == 1 && map.contains_key("$oid")) => Value::Array(
                    map.iter()
                        .map(|(k, v)| {
                            let mut pair = Map::new();
                            pair.insert("k".to_string(), Value::String(k.clone()));
                            pair.insert("v".to_string(), v.clone());
                            Value::Object(pair)
                        })
                        .collect(),
                ),
                Some(other) => {
                    return Err(agg_error(format!(
                        "$objectToArray requires a document, found {}",
                        type_name(other)
                    )))
                }
            }
        }
        "$ifNull" => {
            let mut out = Value::Null;
            for v in values.iter() {
                match v {
                    None | Some(Value::Null) => continue,
                    Some(v) => {
                        out = v.clone();
                        break;
                    }
                }
            }
            if out.is_null() {
                if let Some(Some(last)) = values.last() {
                    out = last.clone();
                }
            }
            out
        }
        "$toString" => {
            expect_args(name, &values, 1)?;
            match &values[0] {
                None | Some(Value::Null) => Value::Null,
                Some(Value::String(s)) => Value::String(s.clone()),
                Some(v) if is_object_id(v) => ObjectId::from_value(v)
                    .map(|oid| Value::String(oid.to_hex().to_string()))
                    .unwrap_or(Value::Null),
                Some(v) if crate::document::is_date(v) => parse_date(v)
                    .map(|d| Value::String(d.to_rfc3339()))
                    .unwrap_or(Value::Null),
                Some(Value::Number(n)) => Value::String(n.to_string()),
                Some(Value::Bool(b)) => Value::String(b.to_string()),
                Some(other) => {
                    return Err(agg_error(format!("Unsupported conversion from {} to string", type_name(other))))
                }
            }
        }
        "$toObjectId" => {
            expect_args(name, &values, 1)?;
            match &values[0] {
                None | Some(Value::Null) => Value::Null,
                Some(v) => ObjectId::from_value(v)
                    .map(|oid| oid.to_value())
                    .ok_or_else(|| agg_error(format!("Failed to parse objectId '{}'", v)))?,
            }
        }
        "$eq" => Value::Bool(compare_args(name, &values)? == Ordering::Equal),
        "$ne" => Value::Bool(compare_args(name, &values)? != Ordering::Equal),
        "$gt" => Value::Bool(compare_args(name, &values)? == Ordering::Greater),
        "$gte" => Value::Bool(compare_args(name, &values)? != Ordering::Less),
        "$lt" => Value::Bool(compare_args(name, &values)? == Ordering::Less),
        "$lte" => Value::Bool(compare_args(name, &values)? != Ordering::Greater),
        "$and" => Value::Bool(values.iter().all(|v| truthy(v.as_ref()))),
        "$or" => Value::Bool(values.iter().any(|v| truthy(v.as_ref()))),
        "$not" => {
            expect_args(name, &values, 1)?;
            Value::Bool(!truthy(values[0].as_ref()))
        }
        "$in" => {
            expect_args(name, &values, 2)?;
            let needle = values[0].clone().unwrap_or(Value::Null);
            match &values[1] {
                Some(Value::Array(items)) => Value::Bool(items.iter().any(|v| values_equal(v, &needle))),
                _ => return Err(agg_error("$in requires an array as a second argument".into())),
            }
        }
        "$add" | "$multiply" => match numeric_args(name, &values)? {
            None => Value::Null,
            Some(nums) => {
                let total = if name == "$add" {
                    nums.iter().sum::<f64>()
                } else {
                    nums.iter().product::<f64>()
                };
                number_to_value(total)
            }
        },
        "$subtract" | "$divide" => {
            expect_args(name, &values, 2)?;
            match numeric_args(name, &values)? {
                None => Value::Null,
                Some(nums) if name == "$subtract" => number_to_value(nums[0] - nums[1]),
                Some(nums) => {
                    if nums[1] == 0.0 {
                        return Err(agg_error("can't $divide by zero".into()));
                    }
                    number_to_value(nums[0] / nums[1])
                }
            }
        }
        "$sum" | "$avg" | "$min" | "$max" => {
            let items = array_operand(values);
            match name {
                "$sum" => number_to_value(items.iter().filter_map(|v| v.as_f64()).sum()),
                "$avg" => {
                    let nums: Vec<f64> = items.iter().filter_map(|v| v.as_f64()).collect();
                    if nums.is_empty() {
                        Value::Null
                    } else {
                        number_to_value(nums.iter().sum::<f64>() / nums.len() as f64)
                    }
                }
                _ => {
                    let present = items.into_iter().filter(|v| !v.is_null());
                    let best = if name == "$min" {
                        present.min_by(compare_values_total)
                    } else {
                        present.max_by(compare_values_total)
                    };
                    best.unwrap_or(Value::Null)
                }
            }
        }
        _ => return Err(agg_error(format!("Unknown expression operator: {}", name))),
    };

    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: Value, doc: Value) -> Option<Value> {
        Expr::parse(&expr).unwrap().eval_doc(&doc).unwrap()
    }

    #[test]
    fn test_field_paths_map_over_lists() {
        let doc = json!({"gt": {"detections": [{"label": "cat"}, {"label": "dog"}, {}]}});
        assert_eq!(eval(json!("$gt.detections.label"), doc.clone()), Some(json!(["cat", "dog"])));
        assert_eq!(eval(json!("$gt.missing"), doc), None);
    }

    #[test]
    fn test_type_and_size() {
        let doc = json!({"tags": ["a", "b"], "n": 1.5});
        assert_eq!(eval(json!({"$type": "$tags"}), doc.clone()), Some(json!("array")));
        assert_eq!(eval(json!({"$type": "$nope"}), doc.clone()), Some(json!("missing")));
        assert_eq!(eval(json!({"$size": "$tags"}), doc.clone()), Some(json!(2)));

        let err = Expr::parse(&json!({"$size": "$n"})).unwrap().eval_doc(&doc);
        assert!(err.is_err());
    }

    #[test]
    fn test_array_elem_at() {
        let doc = json!({"box": [0.1, 0.2, 0.3, 0.4]});
        assert_eq!(eval(json!({"$arrayElemAt": ["$box", 2]}), doc.clone()), Some(json!(0.3)));
        assert_eq!(eval(json!({"$arrayElemAt": ["$box", -1]}), doc.clone()), Some(json!(0.4)));
        assert_eq!(eval(json!({"$arrayElemAt": ["$box", 9]}), doc.clone()), None);
        assert_eq!(eval(json!({"$arrayElemAt": ["$nope", 0]}), doc.clone()), Some(Value::Null));

        let err = Expr::parse(&json!({"$arrayElemAt": ["$box", "x"]})).unwrap().eval_doc(&doc);
        assert!(err.is_err());
    }

    #[test]
    fn test_filter_with_this() {
        let doc = json!({"dets": [{"label": "cat", "confidence": 0.9}, {"label": "dog", "confidence": 0.2}]});
        let expr = json!({"$filter": {"input": "$dets", "as": "this", "cond": {"$gt": ["$$this.confidence", 0.5]}}});
        assert_eq!(eval(expr, doc), Some(json!([{"label": "cat", "confidence": 0.9}])));
    }

    #[test]
    fn test_filter_null_input() {
        let expr = json!({"$filter": {"input": "$dets", "cond": true}});
        assert_eq!(eval(expr, json!({})), Some(Value::Null));
    }

    #[test]
    fn test_let_and_cond() {
        let expr = json!({"$let": {
            "vars": {"this": "$cls"},
            "in": {"$cond": [{"$eq": ["$$this.label", "cat"]}, "$$this", null]}
        }});
        assert_eq!(eval(expr.clone(), json!({"cls": {"label": "cat"}})), Some(json!({"label": "cat"})));
        assert_eq!(eval(expr, json!({"cls": {"label": "dog"}})), Some(Value::Null));
    }

    #[test]
    fn test_object_to_array() {
        let doc = json!({"meta": {"a": 1, "b": "x"}});
        let out = eval(json!({"$objectToArray": "$meta"}), doc).unwrap();
        assert_eq!(out, json!([{"k": "a", "v": 1}, {"k": "b", "v": "x"}]));
    }

    #[test]
    fn test_id_conversions() {
        let oid = ObjectId::new();
        let doc = json!({"_id": oid.to_value()});
        assert_eq!(eval(json!({"$toString": "$_id"}), doc), Some(json!(oid.to_hex())));
        assert_eq!(eval(json!({"$toObjectId": oid.to_hex()}), json!({})), Some(oid.to_value()));
    }

    #[test]
    fn test_if_null_and_literals() {
        assert_eq!(eval(json!({"$ifNull": ["$x", []]}), json!({"x": null})), Some(json!([])));
        assert_eq!(eval(json!({"$literal": "$notafield"}), json!({})), Some(json!("$notafield")));
    }

    #[test]
    fn test_object_expression_builds_document() {
        let out = eval(json!({"a": "$x", "b": "$missing"}), json!({"x": 1})).unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[test]
    fn test_array_accumulator_operators() {
        let doc = json!({"scores": [1, 2, 3]});
        assert_eq!(eval(json!({"$sum": "$scores"}), doc.clone()), Some(json!(6)));
        assert_eq!(eval(json!({"$avg": "$scores"}), doc.clone()), Some(json!(2)));
        assert_eq!(eval(json!({"$max": "$scores"}), doc), Some(json!(3)));
    }
}
