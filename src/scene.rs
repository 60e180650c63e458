use crate::{
    geometry::{Model, Transform},
    hal::Api,
};

/// Ordered list of models plus the "geometry moved" signal the render stage
/// polls once per update.
pub struct Scene<A: Api> {
    models: Vec<Model<A>>,
    geometry_moved: bool,
}

impl<A: Api> Default for Scene<A> {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            geometry_moved: false,
        }
    }
}

impl<A: Api> Scene<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_model(&mut self, model: Model<A>) -> usize {
        log::info!("Added model `{}` ({} meshes)", model.name, model.meshes().len());
        self.models.push(model);
        self.geometry_moved = true;
        self.models.len() - 1
    }

    pub fn remove_model(&mut self, index: usize) -> Option<Model<A>> {
        if index >= self.models.len() {
            return None;
        }
        let model = self.models.remove(index);
        log::info!("Removed model `{}`", model.name);
        self.geometry_moved = true;
        Some(model)
    }

    pub fn models(&self) -> &[Model<A>] {
        &self.models
    }

    /// Mutable access that leaves the moved signal alone; call
    /// `set_transform` or `mark_geometry_moved` for edits that move geometry.
    pub fn model_mut(&mut self, index: usize) -> Option<&mut Model<A>> {
        self.models.get_mut(index)
    }

    pub fn set_transform(&mut self, index: usize, transform: Transform) -> bool {
        match self.models.get_mut(index) {
            Some(model) => {
                model.transform = transform;
                self.geometry_moved = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_geometry_moved(&mut self) {
        self.geometry_moved = true;
    }

    pub fn has_geometry_moved(&self) -> bool {
        self.geometry_moved
    }

    pub fn clear_geometry_moved(&mut self) {
        self.geometry_moved = false;
    }

    /// One instance per mesh, summed over all models.
    pub fn instance_count(&self) -> usize {
        self.models.iter().map(|model| model.meshes().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless;
    use glam::Vec3;

    #[test]
    fn structural_edits_raise_the_signal() {
        let mut scene = Scene::<headless::Api>::new();
        assert!(!scene.has_geometry_moved());

        scene.add_model(Model::new("empty", Transform::default(), Vec::new()));
        assert!(scene.has_geometry_moved());
        scene.clear_geometry_moved();

        assert!(scene.set_transform(0, Transform::from_position(Vec3::Y)));
        assert!(scene.has_geometry_moved());
        assert_eq!(scene.models()[0].transform.position, Vec3::Y);
        scene.clear_geometry_moved();

        assert!(!scene.set_transform(3, Transform::default()));
        assert!(!scene.has_geometry_moved());

        assert!(scene.remove_model(0).is_some());
        assert!(scene.has_geometry_moved());
        assert_eq!(scene.instance_count(), 0);
    }
}
