//! Flat arena for files that pull in further files (a model referencing materials referencing
//! textures, and so on). Nodes never point back at their parents; the parent → children index
//! is keyed by [`NodeId`], so cycles in the source data can't create ownership cycles here.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::{FileReplacement, ReplacementSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
	pub game_path: String,
	pub source: ReplacementSource,
}

#[derive(Debug, Default)]
pub struct FileGraph {
	nodes: Vec<FileNode>,
	by_game_path: HashMap<String, NodeId>,
	children: HashMap<NodeId, Vec<NodeId>>,
}

impl FileGraph {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a file, or returns the existing node when its game path is already known.
	/// The most recently seen source wins.
	pub fn insert(&mut self, game_path: impl Into<String>, source: ReplacementSource) -> NodeId {
		let game_path = game_path.into();

		if let Some(&id) = self.by_game_path.get(&game_path) {
			self.nodes[id.0].source = source;
			return id;
		}

		let id = NodeId(self.nodes.len());
		self.by_game_path.insert(game_path.clone(), id);
		self.nodes.push(FileNode { game_path, source });
		id
	}

	pub fn link(&mut self, parent: NodeId, child: NodeId) {
		let children = self.children.entry(parent).or_default();
		if !children.contains(&child) {
			children.push(child);
		}
	}

	#[must_use]
	pub fn get(&self, id: NodeId) -> Option<&FileNode> {
		self.nodes.get(id.0)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// `root` and everything reachable from it, in discovery order
	#[must_use]
	pub fn closure(&self, root: NodeId) -> Vec<NodeId> {
		let mut visited = HashSet::new();
		let mut ordered = Vec::new();
		let mut stack = vec![root];

		while let Some(id) = stack.pop() {
			if id.0 >= self.nodes.len() || !visited.insert(id) {
				continue;
			}

			ordered.push(id);

			if let Some(children) = self.children.get(&id) {
				// reversed so the first child is visited first
				stack.extend(children.iter().rev());
			}
		}

		ordered
	}

	/// Flattens the closure of every root into one replacement group per source
	pub fn to_replacements(&self, roots: impl IntoIterator<Item = NodeId>) -> Vec<FileReplacement> {
		let mut grouped = BTreeMap::<&ReplacementSource, BTreeSet<String>>::new();

		for root in roots {
			for id in self.closure(root) {
				let node = &self.nodes[id.0];
				grouped
					.entry(&node.source)
					.or_default()
					.insert(node.game_path.clone());
			}
		}

		grouped
			.into_iter()
			.map(|(source, game_paths)| FileReplacement {
				game_paths,
				source: source.clone(),
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;

	fn hashed(byte: char) -> ReplacementSource {
		ReplacementSource::Hash(byte.to_string().repeat(64).parse().unwrap())
	}

	#[test]
	fn closure_survives_cycles() {
		let mut graph = FileGraph::new();
		let model = graph.insert("chara/body.mdl", hashed('1'));
		let material = graph.insert("chara/body.mtrl", hashed('2'));
		let texture = graph.insert("chara/body.tex", hashed('3'));

		graph.link(model, material);
		graph.link(material, texture);
		graph.link(texture, model);

		assert_eq!(graph.closure(model), vec![model, material, texture]);
		assert_eq!(graph.closure(texture), vec![texture, model, material]);
	}

	#[test]
	fn replacements_group_shared_content() {
		let mut graph = FileGraph::new();
		let model = graph.insert("chara/a.mdl", hashed('1'));
		let left = graph.insert("chara/a_l.tex", hashed('2'));
		let right = graph.insert("chara/a_r.tex", hashed('2'));
		let swapped = graph.insert("chara/b.mdl", ReplacementSource::Swap("chara/c.mdl".into()));

		graph.link(model, left);
		graph.link(model, right);

		// inserting a known path again reuses the node
		assert_eq!(graph.insert("chara/a.mdl", hashed('1')), model);
		assert_eq!(graph.len(), 4);

		assert_eq!(
			graph.to_replacements([model, swapped]),
			vec![
				FileReplacement::new(["chara/a.mdl"], hashed('1')),
				FileReplacement::new(["chara/a_l.tex", "chara/a_r.tex"], hashed('2')),
				FileReplacement::new(["chara/b.mdl"], ReplacementSource::Swap("chara/c.mdl".into())),
			]
		);
	}
}
