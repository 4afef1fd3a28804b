//! WGSL compilation and shader interface reflection.
//!
//! Every context compiles stage source through [`compile`], which parses and validates
//! the module with naga and records what the stage reads and writes: location-bound
//! inputs and outputs, the uniform block, and the texture/sampler slots. [`link`] then
//! checks that a vertex stage and a fragment stage fit together.
//!
//! # Binding Convention
//!
//! All resources live in bind group 0:
//!
//! | Resource               | Binding     |
//! |------------------------|-------------|
//! | uniform block (struct) | `0`         |
//! | texture unit `n`       | `1 + 2 * n` |
//! | sampler for unit `n`   | `2 + 2 * n` |
//!
//! ```wgsl
//! struct Params { resolution: vec2<f32>, offset: f32 }
//! @group(0) @binding(0) var<uniform> params: Params;
//! @group(0) @binding(1) var texture0: texture_2d<f32>;
//! @group(0) @binding(2) var sampler0: sampler;
//! ```

use std::fmt;

use naga::{AddressSpace, Binding, ImageDimension, Module, ScalarKind, TypeInner};

/// Binding slot of the uniform block.
pub const UNIFORM_BINDING: u32 = 0;

/// Binding slot of the texture on `unit`.
pub const fn texture_binding(unit: u32) -> u32 {
    1 + 2 * unit
}

/// Binding slot of the sampler paired with the texture on `unit`.
pub const fn sampler_binding(unit: u32) -> u32 {
    2 + 2 * unit
}

/// A programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Shape of a value crossing the host/shader or stage/stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Float { components: u8 },
    Sint { components: u8 },
    Uint { components: u8 },
    Unsupported,
}

impl ValueType {
    fn of(inner: &TypeInner) -> Self {
        let (scalar, components) = match *inner {
            TypeInner::Scalar(scalar) => (scalar, 1),
            TypeInner::Vector { size, scalar } => (scalar, size as u8),
            _ => return ValueType::Unsupported,
        };
        match scalar.kind {
            ScalarKind::Float if scalar.width == 4 => ValueType::Float { components },
            ScalarKind::Sint if scalar.width == 4 => ValueType::Sint { components },
            ScalarKind::Uint if scalar.width == 4 => ValueType::Uint { components },
            _ => ValueType::Unsupported,
        }
    }
}

/// A location-bound stage input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSlot {
    pub location: u32,
    pub name: Option<String>,
    pub ty: ValueType,
}

/// One member of the uniform block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    /// Byte offset inside the block.
    pub offset: u32,
    pub ty: ValueType,
}

/// The `var<uniform>` struct at binding 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlock {
    /// Total size in bytes, including trailing padding.
    pub size: u32,
    pub members: Vec<UniformMember>,
}

impl UniformBlock {
    pub fn member(&self, name: &str) -> Option<&UniformMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// Result of compiling one stage.
#[derive(Debug, Clone)]
pub struct CompiledStage {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub source: String,
    pub inputs: Vec<IoSlot>,
    pub outputs: Vec<IoSlot>,
    pub writes_position: bool,
    pub uniform_block: Option<UniformBlock>,
    pub texture_units: Vec<u32>,
    pub sampler_units: Vec<u32>,
    /// Binding convention violations; reported when the stage is linked.
    pub binding_issues: Vec<String>,
}

/// What a linked program exposes to the host.
#[derive(Debug, Clone)]
pub struct ProgramInterface {
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub vertex_inputs: Vec<IoSlot>,
    pub uniform_block: Option<UniformBlock>,
    /// Sorted texture units sampled by either stage.
    pub texture_units: Vec<u32>,
}

/// Parses and validates `source` as a single WGSL stage.
///
/// The error string is the human-readable info log.
pub fn compile(stage: ShaderStage, source: &str) -> Result<CompiledStage, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| e.emit_to_string(source))?;

    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.stage == stage.naga())
        .ok_or_else(|| format!("no @{stage} entry point in module"))?;

    let mut inputs = Vec::new();
    for arg in &entry.function.arguments {
        collect_io(&module, arg.binding.as_ref(), arg.ty, arg.name.clone(), &mut inputs);
    }

    let mut outputs = Vec::new();
    let writes_position = match &entry.function.result {
        Some(result) => collect_io(&module, result.binding.as_ref(), result.ty, None, &mut outputs),
        None => false,
    };

    let mut compiled = CompiledStage {
        stage,
        entry_point: entry.name.clone(),
        source: source.to_owned(),
        inputs,
        outputs,
        writes_position,
        uniform_block: None,
        texture_units: Vec::new(),
        sampler_units: Vec::new(),
        binding_issues: Vec::new(),
    };
    reflect_globals(&module, &mut compiled);
    Ok(compiled)
}

/// Collects location slots reachable from one argument or result.
///
/// Returns `true` when `@builtin(position)` is among them.
fn collect_io(
    module: &Module,
    binding: Option<&Binding>,
    ty: naga::Handle<naga::Type>,
    name: Option<String>,
    out: &mut Vec<IoSlot>,
) -> bool {
    match binding {
        Some(Binding::Location { location, .. }) => {
            out.push(IoSlot {
                location: *location,
                name,
                ty: ValueType::of(&module.types[ty].inner),
            });
            false
        }
        Some(Binding::BuiltIn(naga::BuiltIn::Position { .. })) => true,
        Some(Binding::BuiltIn(_)) => false,
        None => match &module.types[ty].inner {
            TypeInner::Struct { members, .. } => {
                let mut position = false;
                for member in members {
                    position |= collect_io(
                        module,
                        member.binding.as_ref(),
                        member.ty,
                        member.name.clone(),
                        out,
                    );
                }
                position
            }
            _ => false,
        },
    }
}

fn reflect_globals(module: &Module, stage: &mut CompiledStage) {
    for (_, var) in module.global_variables.iter() {
        let name = var.name.as_deref().unwrap_or("<unnamed>");
        let slot = match (&var.space, &var.binding) {
            (AddressSpace::Private | AddressSpace::WorkGroup, _) => continue,
            (_, Some(rb)) if rb.group == 0 => rb.binding,
            (_, Some(rb)) => {
                stage
                    .binding_issues
                    .push(format!("'{name}' uses bind group {}, only group 0 is supported", rb.group));
                continue;
            }
            (_, None) => continue,
        };

        match (&var.space, &module.types[var.ty].inner) {
            (AddressSpace::Uniform, TypeInner::Struct { members, span }) if slot == UNIFORM_BINDING => {
                let members = members
                    .iter()
                    .map(|m| UniformMember {
                        name: m.name.clone().unwrap_or_default(),
                        offset: m.offset,
                        ty: ValueType::of(&module.types[m.ty].inner),
                    })
                    .collect();
                stage.uniform_block = Some(UniformBlock {
                    size: *span,
                    members,
                });
            }
            (AddressSpace::Uniform, _) => stage.binding_issues.push(format!(
                "uniform '{name}' must be a struct at binding {UNIFORM_BINDING}"
            )),
            (
                AddressSpace::Handle,
                TypeInner::Image {
                    dim: ImageDimension::D2,
                    arrayed: false,
                    ..
                },
            ) if slot % 2 == 1 => stage.texture_units.push((slot - 1) / 2),
            (AddressSpace::Handle, TypeInner::Sampler { .. }) if slot >= 2 && slot % 2 == 0 => {
                stage.sampler_units.push((slot - 2) / 2)
            }
            (AddressSpace::Handle, _) => stage.binding_issues.push(format!(
                "'{name}' at binding {slot} breaks the texture/sampler slot convention"
            )),
            _ => stage
                .binding_issues
                .push(format!("'{name}' uses an unsupported address space")),
        }
    }
}

/// Checks that `vertex` and `fragment` form a complete program.
///
/// The error string is the link info log.
pub fn link(vertex: &CompiledStage, fragment: &CompiledStage) -> Result<ProgramInterface, String> {
    if vertex.stage != ShaderStage::Vertex || fragment.stage != ShaderStage::Fragment {
        return Err("program needs exactly one vertex and one fragment shader".to_owned());
    }

    let issues: Vec<&String> = vertex
        .binding_issues
        .iter()
        .chain(&fragment.binding_issues)
        .collect();
    if !issues.is_empty() {
        return Err(issues.into_iter().cloned().collect::<Vec<_>>().join("\n"));
    }

    if !vertex.writes_position {
        return Err("vertex stage does not write @builtin(position)".to_owned());
    }

    for input in &fragment.inputs {
        let Some(output) = vertex.outputs.iter().find(|o| o.location == input.location) else {
            return Err(format!(
                "fragment input at location {} is not written by the vertex stage",
                input.location
            ));
        };
        if output.ty != input.ty {
            return Err(format!(
                "location {} is {:?} in the vertex stage but {:?} in the fragment stage",
                input.location, output.ty, input.ty
            ));
        }
    }

    if !fragment.outputs.iter().any(|o| o.location == 0) {
        return Err("fragment stage does not write @location(0)".to_owned());
    }

    let uniform_block = match (&vertex.uniform_block, &fragment.uniform_block) {
        (Some(a), Some(b)) if a != b => {
            return Err("uniform block differs between vertex and fragment stages".to_owned());
        }
        (a, b) => a.clone().or_else(|| b.clone()),
    };

    let mut texture_units: Vec<u32> = vertex
        .texture_units
        .iter()
        .chain(&fragment.texture_units)
        .copied()
        .collect();
    texture_units.sort_unstable();
    texture_units.dedup();

    let mut sampler_units: Vec<u32> = vertex
        .sampler_units
        .iter()
        .chain(&fragment.sampler_units)
        .copied()
        .collect();
    sampler_units.sort_unstable();
    sampler_units.dedup();

    if texture_units != sampler_units {
        return Err(format!(
            "every texture unit needs its sampler: textures {texture_units:?}, samplers {sampler_units:?}"
        ));
    }

    Ok(ProgramInterface {
        vertex_entry: vertex.entry_point.clone(),
        fragment_entry: fragment.entry_point.clone(),
        vertex_inputs: vertex.inputs.clone(),
        uniform_block,
        texture_units,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: &str = include_str!("shaders/quad.vert.wgsl");
    const TEXTURE: &str = include_str!("shaders/texture.frag.wgsl");
    const MESH: &str = include_str!("shaders/dynamic_mesh.frag.wgsl");

    #[test]
    fn quad_vertex_stage_reflects_inputs_and_varyings() {
        let stage = compile(ShaderStage::Vertex, VERTEX).unwrap();
        assert_eq!(stage.entry_point, "vs_main");
        assert!(stage.writes_position);

        let locations: Vec<u32> = stage.inputs.iter().map(|i| i.location).collect();
        assert_eq!(locations, vec![0, 1]);
        assert_eq!(stage.inputs[0].ty, ValueType::Float { components: 3 });
        assert_eq!(stage.inputs[1].ty, ValueType::Float { components: 2 });
        assert_eq!(stage.outputs.len(), 1);
    }

    #[test]
    fn uniform_block_offsets_follow_wgsl_layout() {
        let stage = compile(ShaderStage::Fragment, MESH).unwrap();
        let block = stage.uniform_block.unwrap();

        let resolution = block.member("resolution").unwrap();
        assert_eq!(resolution.offset, 0);
        assert_eq!(resolution.ty, ValueType::Float { components: 2 });

        let offset = block.member("offset").unwrap();
        assert_eq!(offset.offset, 8);
        assert_eq!(offset.ty, ValueType::Float { components: 1 });
        assert_eq!(block.size, 16);
        assert_eq!(stage.texture_units, vec![0]);
        assert_eq!(stage.sampler_units, vec![0]);
    }

    #[test]
    fn syntax_error_yields_info_log() {
        let err = compile(ShaderStage::Fragment, "@fragment fn fs_main( -> {").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn missing_entry_point_is_a_compile_error() {
        let err = compile(ShaderStage::Fragment, VERTEX).unwrap_err();
        assert!(err.contains("fragment"));
    }

    #[test]
    fn link_accepts_matching_stages() {
        let vs = compile(ShaderStage::Vertex, VERTEX).unwrap();
        let fs = compile(ShaderStage::Fragment, TEXTURE).unwrap();
        let program = link(&vs, &fs).unwrap();
        assert_eq!(program.texture_units, vec![0]);
        assert!(program.uniform_block.is_none());
        assert_eq!(program.fragment_entry, "fs_main");
    }

    #[test]
    fn link_rejects_varying_type_mismatch() {
        let vs = compile(ShaderStage::Vertex, VERTEX).unwrap();
        let fs = compile(
            ShaderStage::Fragment,
            "@fragment fn fs_main(@location(0) uv: vec4<f32>) -> @location(0) vec4<f32> { return uv; }",
        )
        .unwrap();
        assert!(link(&vs, &fs).unwrap_err().contains("location 0"));
    }

    #[test]
    fn link_rejects_unwritten_varying() {
        let vs = compile(ShaderStage::Vertex, VERTEX).unwrap();
        let fs = compile(
            ShaderStage::Fragment,
            "@fragment fn fs_main(@location(3) c: vec4<f32>) -> @location(0) vec4<f32> { return c; }",
        )
        .unwrap();
        assert!(link(&vs, &fs).unwrap_err().contains("location 3"));
    }

    #[test]
    fn link_rejects_texture_without_sampler() {
        let vs = compile(ShaderStage::Vertex, VERTEX).unwrap();
        let fs = compile(
            ShaderStage::Fragment,
            r#"
            @group(0) @binding(1) var texture0: texture_2d<f32>;
            @fragment fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
                return textureLoad(texture0, vec2<i32>(0, 0), 0);
            }
            "#,
        )
        .unwrap();
        assert!(link(&vs, &fs).unwrap_err().contains("sampler"));
    }

    #[test]
    fn binding_outside_group_zero_fails_at_link() {
        let vs = compile(ShaderStage::Vertex, VERTEX).unwrap();
        let fs = compile(
            ShaderStage::Fragment,
            r#"
            struct P { v: f32 }
            @group(1) @binding(0) var<uniform> p: P;
            @fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(p.v); }
            "#,
        )
        .unwrap();
        assert!(link(&vs, &fs).unwrap_err().contains("group 1"));
    }
}
