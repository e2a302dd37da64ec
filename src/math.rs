use deps::*;

use bevy::prelude::*;

pub mod real {
    pub use std::f32::*;
}

pub type TReal = f32;
pub type TVec2 = Vec2;
pub type TVec3 = Vec3;
pub type TQuat = Quat;
