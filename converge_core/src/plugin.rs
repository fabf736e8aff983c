use crate::error::{CompileError, Location};
use crate::types::Type;
use crate::value::Value;
use std::fmt;

/// The callable behind a plugin. Must be side effect free from the
/// compiler's point of view; errors are reported as plain messages and
/// wrapped with the triggering call site.
pub type PluginBody = Box<dyn Fn(&[Value]) -> Result<Value, String>>;

/// A plugin callable with a typed signature.
///
/// Plugins are registered into the namespace before compilation starts and
/// invoked strictly: every argument is fully bound before the body runs. Any
/// `Unknown` argument short-circuits to an `Unknown` result without invoking
/// the body at all.
pub struct PluginFunction {
    name: String,
    params: Vec<(String, Type)>,
    returns: Type,
    body: PluginBody,
}

impl PluginFunction {
    pub fn new(
        name: impl Into<String>,
        params: Vec<(String, Type)>,
        returns: Type,
        body: PluginBody,
    ) -> Self {
        PluginFunction {
            name: name.into(),
            params,
            returns,
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind positional and keyword arguments to the signature, then invoke.
    pub fn invoke(
        &self,
        args: &[Value],
        kwargs: &[(String, Value)],
        location: &Location,
    ) -> Result<Value, CompileError> {
        if args.len() > self.params.len() {
            return Err(self.error(
                format!(
                    "expected at most {} arguments, got {}",
                    self.params.len(),
                    args.len()
                ),
                location,
            ));
        }

        let mut bound: Vec<Option<Value>> = vec![None; self.params.len()];
        for (slot, value) in bound.iter_mut().zip(args.iter()) {
            *slot = Some(value.clone());
        }
        for (name, value) in kwargs {
            match self.params.iter().position(|(p, _)| p == name) {
                Some(i) if bound[i].is_none() => bound[i] = Some(value.clone()),
                Some(_) => {
                    return Err(
                        self.error(format!("argument {} passed twice", name), location)
                    );
                }
                None => {
                    return Err(self.error(format!("unknown argument {}", name), location));
                }
            }
        }

        let mut resolved = Vec::with_capacity(self.params.len());
        for ((name, ty), value) in self.params.iter().zip(bound) {
            let value = value
                .ok_or_else(|| self.error(format!("missing argument {}", name), location))?;
            if value.is_unknown() {
                return Ok(Value::Unknown);
            }
            ty.validate(&value).map_err(|message| {
                self.error(format!("argument {}: {}", name, message), location)
            })?;
            resolved.push(value);
        }

        let result = (self.body)(&resolved).map_err(|message| self.error(message, location))?;
        self.returns
            .validate(&result)
            .map_err(|message| self.error(format!("return value: {}", message), location))?;
        Ok(result)
    }

    fn error(&self, message: String, location: &Location) -> CompileError {
        CompileError::Plugin {
            name: self.name.clone(),
            message,
            location: location.clone(),
        }
    }
}

impl fmt::Debug for PluginFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PluginFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upper() -> PluginFunction {
        PluginFunction::new(
            "std::upper",
            vec![("text".to_string(), Type::string())],
            Type::string(),
            Box::new(|args| match &args[0] {
                Value::String(s) => Ok(Value::String(s.to_uppercase())),
                _ => Err("expected a string".to_string()),
            }),
        )
    }

    #[test]
    fn invoke_positional() {
        let f = upper();
        let out = f
            .invoke(&[Value::string("abc")], &[], &Location::new("t", 1))
            .unwrap();
        assert_eq!(out, Value::string("ABC"));
    }

    #[test]
    fn invoke_by_keyword() {
        let f = upper();
        let out = f
            .invoke(
                &[],
                &[("text".to_string(), Value::string("x"))],
                &Location::new("t", 1),
            )
            .unwrap();
        assert_eq!(out, Value::string("X"));
    }

    #[test]
    fn unknown_short_circuits() {
        let f = upper();
        let out = f
            .invoke(&[Value::Unknown], &[], &Location::new("t", 1))
            .unwrap();
        assert!(out.is_unknown());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let f = upper();
        let err = f.invoke(&[Value::Int(3)], &[], &Location::new("t", 1));
        assert!(err.is_err());
    }
}
