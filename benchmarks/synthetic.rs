use anyhow::Result;
use dist_tree::{DecisionTreeClassifier, Partition, RfDataset, TrainOptions};
use ndarray::prelude::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use std::time::Instant;

fn main() -> Result<()> {
	// generate the data: gaussian blobs, one per class, spread over several partitions
	let n_partitions = 8;
	let rows_per_partition = 5_000;
	let n_features = 16;
	let n_classes = 4;
	let mut rng = Xoshiro256Plus::seed_from_u64(0);
	let class_names = ["alpha", "beta", "gamma", "delta"];
	let mut partitions = Vec::with_capacity(n_partitions);
	for _ in 0..n_partitions {
		let mut samples = Array2::zeros((rows_per_partition, n_features));
		let mut labels = Vec::with_capacity(rows_per_partition);
		for mut row in samples.genrows_mut() {
			let class = rng.gen_range(0, n_classes);
			for (feature_index, value) in row.iter_mut().enumerate() {
				let center = if feature_index % n_classes == class {
					4.0
				} else {
					0.0
				};
				// sum of uniforms as a cheap approximate gaussian
				let noise: f32 = (0..4).map(|_| rng.gen_range(-1.0f32, 1.0)).sum();
				*value = center + noise;
			}
			labels.push(class_names[class].to_owned());
		}
		partitions.push(Partition { samples, labels });
	}

	// assemble the dataset on disk
	let dir = std::env::temp_dir().join("dist_tree_benchmark_synthetic");
	std::fs::create_dir_all(&dir)?;
	let start = Instant::now();
	let dataset = RfDataset::from_partitions(
		&partitions,
		dir.join("samples.npy"),
		dir.join("labels.txt"),
	)?;
	println!("assembly duration: {:?}", start.elapsed());

	// train the model
	let train_options = TrainOptions {
		distr_depth: 3,
		seed: Some(0),
		..Default::default()
	};
	let mut tree = DecisionTreeClassifier::new(train_options);
	let start = Instant::now();
	tree.fit(&dataset)?;
	println!("fit duration: {:?}", start.elapsed());

	// make predictions on the training data and compute the accuracy
	let classes = dataset.classes()?.to_owned();
	let mut n_correct = 0;
	let mut n_total = 0;
	let start = Instant::now();
	for partition in partitions.iter() {
		let predictions = tree.predict(partition.samples.view())?;
		for (prediction, label) in predictions.iter().zip(partition.labels.iter()) {
			if classes[*prediction] == *label {
				n_correct += 1;
			}
			n_total += 1;
		}
	}
	println!("predict duration: {:?}", start.elapsed());
	println!("accuracy: {}", n_correct as f32 / n_total as f32);

	Ok(())
}
