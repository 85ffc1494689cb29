// bathy_sim/src/simulation/utils/serde_helpers.rs

pub mod vec3_from_array {
    use nalgebra::Vector3;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(vec: &Vector3<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq([vec.x, vec.y, vec.z].iter())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vector3<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let arr: [f64; 3] = Deserialize::deserialize(deserializer)?;
        Ok(Vector3::from(arr))
    }
}

/// `[roll, pitch, yaw]` in degrees, composed as `Rx · Ry · Rz` like the core's poses.
pub mod rotation_from_rpy_deg {
    use bathy_core::types::rotation_from_rpy;
    use nalgebra::{Rotation3, Vector3};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(rotation: &Rotation3<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let m = rotation.matrix();
        let pitch = m[(0, 2)].clamp(-1.0, 1.0).asin();
        let yaw = (-m[(0, 1)]).atan2(m[(0, 0)]);
        let roll = (-m[(1, 2)]).atan2(m[(2, 2)]);
        let arr = [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()];
        serializer.collect_seq(arr.iter())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Rotation3<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let arr: [f64; 3] = Deserialize::deserialize(deserializer)?;
        Ok(rotation_from_rpy(&Vector3::from(arr.map(f64::to_radians))))
    }
}
